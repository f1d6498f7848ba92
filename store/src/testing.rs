// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures for tests of this crate and the daemons built on it

use crate::FWGroup;
use crate::FWRule;
use crate::Flavor;
use crate::Guest;
use crate::Hypervisor;
use crate::Metadata;
use crate::Resources;
use crate::Store;
use crate::Subnet;
use corral_kv::sim::SimKv;
use slog::Logger;
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

/// A store rooted at "/corral" over an empty [`SimKv`]
pub fn store(log: &Logger) -> Store {
    Store::new(log, Arc::new(SimKv::new()), "/corral", crate::DEFAULT_JOB_TTL)
}

pub fn hypervisor(cpu: u32, memory: u64) -> Hypervisor {
    let resources = Resources { memory, disk: 500, cpu };
    Hypervisor {
        id: Uuid::new_v4(),
        ip: Ipv4Addr::new(10, 0, 0, 10),
        mac: String::from("52:54:00:00:00:10"),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(10, 0, 0, 1),
        total_resources: resources,
        available_resources: resources,
        metadata: Metadata::new(),
        version: 0,
    }
}

pub fn flavor(cpu: u32, memory: u64) -> Flavor {
    Flavor {
        id: Uuid::new_v4(),
        name: format!("{}cpu", cpu),
        resources: Resources { memory, disk: 20, cpu },
        metadata: Metadata::new(),
        version: 0,
    }
}

/// 10.10.0.0/24, handing out .10 to .200
pub fn subnet() -> Subnet {
    Subnet {
        id: Uuid::new_v4(),
        cidr: String::from("10.10.0.0/24"),
        gateway: Ipv4Addr::new(10, 10, 0, 1),
        start_range: Ipv4Addr::new(10, 10, 0, 10),
        end_range: Ipv4Addr::new(10, 10, 0, 200),
        metadata: Metadata::new(),
        version: 0,
    }
}

/// An unplaced guest on `subnet` with address `ip`
pub fn guest(subnet: &Subnet, ip: Ipv4Addr) -> Guest {
    let mut guest = Guest::new(Uuid::new_v4());
    guest.subnet_id = Some(subnet.id);
    guest.ip = Some(ip);
    guest.mac = format!("52:54:00:10:00:{:02x}", ip.octets()[3]);
    guest
}

pub fn fwgroup(rules: Vec<FWRule>) -> FWGroup {
    FWGroup { id: Uuid::new_v4(), rules, metadata: Metadata::new(), version: 0 }
}
