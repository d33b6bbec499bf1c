// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Predicted state from the last dry-run.
//!
//! A dry-run adjust prints the low-level `drbdsetup` calls it would make. Reading those back
//! tells which resources each host would connect, disconnect, attach or detach, without touching
//! the real status of any device.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    resource::{minor_of, Address},
    state::{ConnectionState, DeviceStatus, DiskState},
    topology::Topology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prediction {
    Connected,
    Disconnected,
    Attached,
    Diskless,
}

impl Prediction {
    fn opposite(&self) -> Prediction {
        match self {
            Prediction::Connected => Prediction::Disconnected,
            Prediction::Disconnected => Prediction::Connected,
            Prediction::Attached => Prediction::Diskless,
            Prediction::Diskless => Prediction::Attached,
        }
    }
}

/// What one host printed for the dry-run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOutput {
    pub output: String,

    /// `None` when the command could not be run at all.
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl HostOutput {
    pub fn is_ok(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }
}

/// Predictions of one dry-run, keyed by host and resource, plus each host's raw output.
#[derive(Debug, Clone, Default)]
pub struct TestOverlay {
    predictions: HashMap<(String, String), BTreeSet<Prediction>>,
    outputs: BTreeMap<String, HostOutput>,
}

impl TestOverlay {
    /// Interpret the dry-run output of every host against the topology that was rendered.
    pub fn build(topology: &Topology, outputs: BTreeMap<String, HostOutput>) -> Self {
        let mut overlay = TestOverlay {
            predictions: HashMap::new(),
            outputs: BTreeMap::new(),
        };
        for (host, out) in outputs.iter() {
            for line in out.output.lines() {
                overlay.interpret(topology, host, line);
            }
        }
        overlay.outputs = outputs;
        overlay
    }

    fn predict(&mut self, host: &str, resource: &str, prediction: Prediction) {
        let set = self
            .predictions
            .entry((host.to_string(), resource.to_string()))
            .or_default();
        set.remove(&prediction.opposite());
        set.insert(prediction);
    }

    /// One line of `drbdadm -d` output. DRBD 8.4 prints `drbdsetup[-84] <cmd> <object> ...`;
    /// earlier releases print `drbdsetup <device> <cmd> ...`.
    fn interpret(&mut self, topology: &Topology, host: &str, line: &str) {
        let mut words = line.split_whitespace();
        if !words
            .next()
            .is_some_and(|w| w.rsplit('/').next().unwrap_or(w).starts_with("drbdsetup"))
        {
            return;
        }
        let (Some(first), Some(second)) = (words.next(), words.next()) else {
            return;
        };
        let (subcommand, object) = if first.starts_with("/dev/") {
            (second, first)
        } else {
            (first, second)
        };

        let predictions: &[Prediction] = match subcommand {
            "attach" | "disk" => &[Prediction::Attached],
            "detach" => &[Prediction::Diskless],
            "connect" | "net" => &[Prediction::Connected],
            "disconnect" => &[Prediction::Disconnected],
            "down" => &[Prediction::Disconnected, Prediction::Diskless],
            _ => return,
        };
        let Some(resource) = resolve(topology, host, object) else {
            debug!("{host}: cannot attribute dry-run line '{line}'");
            return;
        };
        for prediction in predictions {
            self.predict(host, &resource, *prediction);
        }
    }

    pub fn predictions(&self, host: &str, resource: &str) -> Option<&BTreeSet<Prediction>> {
        self.predictions
            .get(&(host.to_string(), resource.to_string()))
    }

    pub fn predicts(&self, host: &str, resource: &str, prediction: Prediction) -> bool {
        self.predictions(host, resource)
            .is_some_and(|p| p.contains(&prediction))
    }

    pub fn output(&self, host: &str) -> Option<&HostOutput> {
        self.outputs.get(host)
    }

    /// The status an endpoint would have after the change, for display. The real status is
    /// left alone.
    pub fn predicted_status(
        &self,
        host: &str,
        resource: &str,
        current: &DeviceStatus,
    ) -> DeviceStatus {
        let mut status = current.clone();
        for prediction in self.predictions(host, resource).into_iter().flatten() {
            match prediction {
                Prediction::Connected => status.connection = ConnectionState::Connected,
                Prediction::Disconnected => status.connection = ConnectionState::StandAlone,
                Prediction::Attached => status.disk = DiskState::Attached,
                Prediction::Diskless => status.disk = DiskState::Diskless,
            }
        }
        status
    }
}

/// Find the resource a drbdsetup object refers to on `host`: a resource name, a minor number, a
/// device path or the local replication address.
fn resolve(topology: &Topology, host: &str, object: &str) -> Option<String> {
    if topology.resource(object).is_some() {
        return Some(object.to_string());
    }

    let minor = object.parse::<u32>().ok().or_else(|| minor_of(object));
    if let Some(minor) = minor {
        let path = format!("/dev/drbd{minor}");
        if let Some(id) = topology.volume_by_device_path(&path) {
            return Some(id.resource.clone());
        }
    }
    if let Some(id) = topology.volume_by_device_path(object) {
        return Some(id.resource.clone());
    }

    // `ipv4:10.0.0.1:7788`, or a bare `10.0.0.1:7788` before 8.4.
    let addr = match object.split_once(':') {
        Some((family, rest))
            if family.chars().all(|c| c.is_ascii_alphanumeric()) && rest.contains(':') =>
        {
            Address::parse(&[family, rest])
        }
        _ => Address::parse(&[object]),
    }?;
    topology
        .resources()
        .find(|r| {
            r.host_binding(host)
                .and_then(|b| b.address.as_ref())
                .is_some_and(|a| a.ip == addr.ip && a.port == addr.port)
        })
        .map(|r| r.name().to_string())
}

/// The current overlay of a cluster. It is replaced as a whole by each dry-run; readers take a
/// reference to the snapshot and never hold the lock while using it.
#[derive(Debug, Default)]
pub struct OverlayCell {
    current: Mutex<Option<Arc<TestOverlay>>>,
}

impl OverlayCell {
    pub fn replace(&self, overlay: TestOverlay) {
        *self.current.lock().unwrap() = Some(Arc::new(overlay));
    }

    pub fn get(&self) -> Option<Arc<TestOverlay>> {
        self.current.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::{BlockDevice, Host},
        resource::HostBinding,
    };

    fn topology() -> Topology {
        let mut t = Topology::new();
        for name in ["alpha", "beta"] {
            let mut host = Host::new(name, Some(22));
            host.block_devices
                .insert("/dev/sdb".to_string(), BlockDevice::new("/dev/sdb"));
            t.add_host(host).unwrap();
        }
        let bindings = [("alpha", "10.0.0.1"), ("beta", "10.0.0.2")]
            .into_iter()
            .map(|(h, ip)| {
                (
                    h.to_string(),
                    HostBinding {
                        address: Some(Address::new(ip, 7788)),
                        proxy: None,
                    },
                )
            })
            .collect();
        t.add_resource("r0", bindings).unwrap();
        t.add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        t
    }

    fn output(text: &str) -> HostOutput {
        HostOutput {
            output: text.to_string(),
            exit_code: Some(0),
            error: None,
        }
    }

    #[test]
    fn interprets_84_output() {
        let t = topology();
        let outputs = BTreeMap::from([
            (
                "alpha".to_string(),
                output(
                    "drbdsetup-84 new-resource r0\n\
                     drbdmeta 0 v08 /dev/sdb internal apply-al\n\
                     drbdsetup-84 attach 0 /dev/sdb /dev/sdb internal\n\
                     drbdsetup-84 connect r0 ipv4:10.0.0.1:7788 ipv4:10.0.0.2:7788 --protocol=C\n",
                ),
            ),
            (
                "beta".to_string(),
                output("drbdsetup-84 disconnect ipv4:10.0.0.2:7788 ipv4:10.0.0.1:7788\n"),
            ),
        ]);
        let overlay = TestOverlay::build(&t, outputs);

        assert!(overlay.predicts("alpha", "r0", Prediction::Attached));
        assert!(overlay.predicts("alpha", "r0", Prediction::Connected));
        assert!(overlay.predicts("beta", "r0", Prediction::Disconnected));
        assert!(!overlay.predicts("beta", "r0", Prediction::Connected));

        let status = overlay.predicted_status("beta", "r0", &DeviceStatus::default());
        assert_eq!(status.connection, ConnectionState::StandAlone);
        assert!(overlay.output("alpha").unwrap().is_ok());
    }

    #[test]
    fn interprets_83_output_and_later_lines_win() {
        let t = topology();
        let outputs = BTreeMap::from([(
            "alpha".to_string(),
            output(
                "drbdsetup /dev/drbd0 disk /dev/sdb /dev/sdb internal --set-defaults\n\
                 drbdsetup /dev/drbd0 net 10.0.0.1:7788 10.0.0.2:7788 C\n\
                 drbdsetup /dev/drbd0 down\n",
            ),
        )]);
        let overlay = TestOverlay::build(&t, outputs);
        let predictions: Vec<_> = overlay
            .predictions("alpha", "r0")
            .unwrap()
            .iter()
            .copied()
            .collect();
        assert_eq!(predictions, vec![Prediction::Disconnected, Prediction::Diskless]);
    }

    #[test]
    fn cell_is_replaced_wholesale() {
        let cell = OverlayCell::default();
        assert!(cell.get().is_none());
        let t = topology();
        cell.replace(TestOverlay::build(
            &t,
            BTreeMap::from([("alpha".to_string(), output("drbdsetup-84 down r0\n"))]),
        ));
        let snapshot = cell.get().unwrap();
        cell.replace(TestOverlay::default());
        assert!(snapshot.predicts("alpha", "r0", Prediction::Diskless));
        assert!(cell.get().unwrap().predictions("alpha", "r0").is_none());
        cell.clear();
        assert!(cell.get().is_none());
    }
}
