// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! conf_builder.rs
//!
//! Renders the DRBD configuration file of one resource.

use std::net::IpAddr;

use crate::layer::{DrbdResource, PeerResource};

/// Placeholder for the backing disk of a peer; drbdadm only needs it to know the peer has one.
const PEER_DISK_PLACEHOLDER: &str = "/dev/drbd/this/is/not/used";

const INDENT: &str = "    ";

struct ConfWriter {
    out: String,
    depth: usize,
}

impl ConfWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            depth: 0,
        }
    }

    fn line(&mut self, text: &str) {
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.out.push_str(INDENT);
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    fn open(&mut self, header: &str) {
        self.line(header);
        self.line("{");
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn address(addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(v4) => format!("ipv4 {v4}:{port}"),
        IpAddr::V6(v6) => format!("ipv6 [{v6}]:{port}"),
    }
}

fn local_host(w: &mut ConfWriter, rsc: &DrbdResource) {
    w.open(&format!("on {}", quote(&rsc.node_name)));
    for vlm in rsc
        .volumes
        .values()
        .filter(|v| !v.flags.is_marked_for_removal())
    {
        w.open(&format!("volume {}", vlm.vlm_nr));
        match (&vlm.data_device, rsc.is_diskless()) {
            (Some(disk), false) => {
                w.line(&format!("disk        {disk};"));
                w.open("disk");
                w.line("discard-zeroes-if-aligned yes;");
                w.close();
                match &vlm.meta_disk_path {
                    Some(meta) => w.line(&format!("meta-disk   {meta};")),
                    None => w.line("meta-disk   internal;"),
                }
            }
            _ => w.line("disk        none;"),
        }
        w.line(&format!("device      minor {};", vlm.minor));
        w.close();
    }
    w.line(&format!("node-id    {};", rsc.node_id));
    w.close();
}

fn peer_host(w: &mut ConfWriter, rsc: &DrbdResource, peer: &PeerResource) {
    w.open(&format!("on {}", quote(&peer.node_name)));
    for (vlm_nr, _) in peer
        .volumes
        .iter()
        .filter(|(_, v)| !v.flags.is_marked_for_removal())
    {
        let Some(def) = rsc.definition.volume(*vlm_nr) else {
            continue;
        };
        w.open(&format!("volume {vlm_nr}"));
        if peer.is_diskless() {
            w.line("disk        none;");
        } else {
            w.line(&format!("disk        {PEER_DISK_PLACEHOLDER};"));
            w.line("meta-disk   internal;");
        }
        w.line(&format!("device      minor {};", def.minor));
        w.close();
    }
    w.line(&format!("node-id    {};", peer.node_id));
    w.close();
}

/// Render the configuration file content. Peers that are being removed or are inactive are left
/// out.
pub fn render(rsc: &DrbdResource) -> String {
    let def = &rsc.definition;
    let name = rsc.suffixed_name();
    let mut w = ConfWriter::new();

    w.line("# This file was generated by replicad, do not edit manually.");
    w.line(&format!("# Local node: {}", rsc.node_name));
    w.line("");

    w.open(&format!("resource {}", quote(&name)));

    w.open("options");
    w.line("auto-promote yes;");
    w.close();
    w.line("");

    w.open("net");
    if def.transport != "tcp" {
        w.line(&format!("transport         {};", quote(&def.transport)));
    }
    if let Some(secret) = &def.secret {
        w.line("cram-hmac-alg     sha1;");
        w.line(&format!("shared-secret     {};", quote(secret)));
    }
    w.line(&format!("protocol          {};", def.protocol));
    w.close();
    w.line("");

    local_host(&mut w, rsc);

    let peers: Vec<&PeerResource> = rsc.active_peers().collect();
    for peer in &peers {
        w.line("");
        peer_host(&mut w, rsc, peer);
    }

    for peer in &peers {
        w.line("");
        w.open("connection");
        w.line(&format!(
            "host {} address {};",
            quote(&rsc.node_name),
            address(rsc.address, def.tcp_port)
        ));
        w.line(&format!(
            "host {} address {};",
            quote(&peer.node_name),
            address(peer.address, def.tcp_port)
        ));
        w.close();
    }

    w.close();
    w.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flags::{ResourceFlag, VolumeFlag},
        test_env::{drbd_resource, peer},
    };

    #[test]
    fn renders_local_volumes_and_connections() {
        let mut rsc = drbd_resource("r0", &[0, 1]);
        rsc.volumes.get_mut(&1).unwrap().meta_disk_path = Some("/dev/vg/r0.meta_00001".to_string());
        rsc.peers.push(peer("beta", 1));

        let conf = render(&rsc);
        assert!(conf.contains("resource \"r0\"\n{"));
        assert!(conf.contains("disk        /dev/vg/r0_00000;"));
        assert!(conf.contains("meta-disk   /dev/vg/r0.meta_00001;"));
        assert!(conf.contains("device      minor 1001;"));
        assert!(conf.contains("host \"beta\" address ipv4 10.0.0.2:7000;"));
        assert!(conf.contains(&format!("disk        {PEER_DISK_PLACEHOLDER};")));
    }

    #[test]
    fn removed_and_inactive_peers_are_left_out() {
        let mut rsc = drbd_resource("r0", &[0]);
        let mut gone = peer("beta", 1);
        gone.flags.insert(ResourceFlag::Delete);
        let mut asleep = peer("gamma", 2);
        asleep.flags.insert(ResourceFlag::Inactive);
        let mut client = peer("delta", 3);
        client.flags.insert(ResourceFlag::DrbdDiskless);
        rsc.peers.extend([gone, asleep, client]);

        let conf = render(&rsc);
        assert!(!conf.contains("beta"));
        assert!(!conf.contains("gamma"));
        assert!(conf.contains("on \"delta\""));
        assert_eq!(conf.matches("connection\n").count(), 1);
    }

    #[test]
    fn deleted_volume_and_diskless_resource() {
        let mut rsc = drbd_resource("r0", &[0, 1]);
        rsc.volumes
            .get_mut(&1)
            .unwrap()
            .flags
            .insert(VolumeFlag::Delete);
        assert!(!render(&rsc).contains("volume 1"));

        rsc.flags.insert(ResourceFlag::DrbdDiskless);
        let conf = render(&rsc);
        assert!(conf.contains("disk        none;"));
        assert!(!conf.contains("meta-disk"));
    }

    #[test]
    fn rendering_is_stable() {
        let mut rsc = drbd_resource("r0", &[0]);
        rsc.peers.push(peer("beta", 1));
        assert_eq!(render(&rsc), render(&rsc));
        assert_eq!(address("fe80::1".parse().unwrap(), 7000), "ipv6 [fe80::1]:7000");
    }
}
