//! End-to-end tunnel scenarios over simulated transports
//!
//! Multi-router builds, transit decline under capacity pressure, and
//! fragment reassembly at the outbound endpoint, all driven through full
//! `RouterCore` nodes wired to an in-memory transport fabric.

use std::sync::Arc;

use garlicnet_core::{
    I2npMessage, IdentHash, MessageType, RouterConfig, TransportAddress, TransportKind,
    TransportSet,
};
use garlicnet_crypto::Identity;
use garlicnet_router::{RouterCore, SimTransports, Transports};
use garlicnet_tunnel::{PoolOwner, PoolSettings, TunnelDelivery, TunnelMessageBlock};

struct SimRouter {
    core: RouterCore,
    transports: Arc<SimTransports>,
    ident: IdentHash,
}

fn make_router(config: RouterConfig) -> SimRouter {
    let keys = Identity::generate();
    // ident hash depends on the keys; build a probe identity first
    let probe = garlicnet_core::PeerIdentity::new(
        keys.signing.public_key_bytes(),
        keys.encryption.public_key_bytes(),
    );
    let hash = probe.hash();
    let addresses = vec![TransportAddress {
        kind: TransportKind::Ntcp2,
        host: format!("10.{}.{}.{}", hash[0], hash[1], hash[2]),
        port: 9000,
    }];
    let transports = Arc::new(SimTransports::new(hash));
    let core = RouterCore::new(
        keys,
        config,
        addresses,
        Arc::new(garlicnet_core::MemoryStorage::new()),
        transports.clone(),
    );
    let ident = core.ident_hash();
    SimRouter {
        core,
        transports,
        ident,
    }
}

/// Seed every router with every other router's descriptor and mark the
/// transport sessions up.
fn mesh(routers: &mut [SimRouter]) {
    let infos: Vec<_> = routers
        .iter_mut()
        .map(|r| {
            r.core.context.reachability_v4 = garlicnet_router::Reachability::Ok;
            r.core
                .context
                .build_router_info(garlicnet_core::CongestionLevel::Low)
        })
        .collect();
    for router in routers.iter_mut() {
        for info in &infos {
            if info.hash() != router.ident {
                router.core.netdb.add_router_info(info.clone()).unwrap();
            }
        }
    }
    let idents: Vec<IdentHash> = routers.iter().map(|r| r.ident).collect();
    for router in routers.iter() {
        for ident in &idents {
            if *ident != router.ident {
                router.transports.connect(*ident, TransportSet::NTCP2_V4);
            }
        }
    }
}

/// Move queued messages between routers until the fabric is quiet.
/// Returns the log of (from, to, type) triples seen.
fn pump(routers: &mut [SimRouter]) -> Vec<(IdentHash, IdentHash, MessageType)> {
    let mut log = Vec::new();
    for _ in 0..64 {
        let mut moved = false;
        let batches: Vec<(IdentHash, Vec<(IdentHash, I2npMessage)>)> = routers
            .iter()
            .map(|r| (r.ident, r.transports.drain()))
            .collect();
        for (from, batch) in batches {
            for (to, msg) in batch {
                moved = true;
                log.push((from, to, msg.msg_type()));
                if let Some(target) = routers.iter_mut().find(|r| r.ident == to) {
                    target.core.handle_message(from, msg);
                }
            }
        }
        if !moved {
            break;
        }
    }
    log
}

#[test]
fn two_hop_outbound_build_and_gateway_delivery() {
    garlicnet_logging::init_for_tests();
    let mut routers = vec![
        make_router(RouterConfig::default()),
        make_router(RouterConfig::default()),
        make_router(RouterConfig::default()),
        make_router(RouterConfig::default()),
    ];
    mesh(&mut routers);
    let (r1, r2, r3) = (routers[1].ident, routers[2].ident, routers[3].ident);

    // build a 2-hop outbound tunnel R0 -> R1 -> R2
    let pool_id = routers[0].core.tunnels.create_pool(
        PoolOwner::Destination([5u8; 32]),
        PoolSettings {
            out_length: 2,
            out_quantity: 1,
            in_quantity: 0,
            explicit_peers: Some(vec![r1, r2]),
            ..Default::default()
        },
    );
    let snapshot = garlicnet_netdb::NetDbSnapshot {
        routers: vec![
            routers[0].core.netdb.lookup_router(&r1).unwrap(),
            routers[0].core.netdb.lookup_router(&r2).unwrap(),
        ],
        floodfills: vec![],
    };
    let outputs = routers[0]
        .core
        .tunnels
        .build_tunnel(pool_id, false, &snapshot, |_| true)
        .expect("hops selected");
    for output in outputs {
        if let garlicnet_tunnel::TunnelOutput::SendDirect { to, msg } = output {
            routers[0].transports.send_message(&to, msg);
        }
    }
    pump(&mut routers);

    let tunnel_established = routers[0]
        .core
        .tunnels
        .pool(pool_id)
        .and_then(|p| p.next_outbound(&[], TransportSet::all(), |_| TransportSet::all()))
        .is_some();
    assert!(tunnel_established, "2-hop tunnel established");
    assert_eq!(routers[1].core.tunnels.transit_count(), 1);
    assert_eq!(routers[2].core.tunnels.transit_count(), 1);

    // a DeliveryStatus with tunnel delivery to (R3, 7) must surface at R2
    // as exactly one TunnelGateway toward R3
    let status = I2npMessage::new(MessageType::DeliveryStatus, 42, b"probe");
    let outputs = routers[0]
        .core
        .tunnels
        .send_blocks(
            pool_id,
            vec![TunnelMessageBlock {
                delivery: TunnelDelivery::Tunnel {
                    to: r3,
                    tunnel_id: 7,
                },
                msg: status,
            }],
            &[],
        )
        .unwrap();
    for output in outputs {
        if let garlicnet_tunnel::TunnelOutput::SendDirect { to, msg } = output {
            routers[0].transports.send_message(&to, msg);
        }
    }
    let log = pump(&mut routers);

    let gateways: Vec<_> = log
        .iter()
        .filter(|(from, to, ty)| {
            *from == routers[2].ident && *to == r3 && *ty == MessageType::TunnelGateway
        })
        .collect();
    assert_eq!(gateways.len(), 1, "exactly one TunnelGateway to R3");
}

#[test]
fn transit_decline_when_capacity_exhausted() {
    garlicnet_logging::init_for_tests();
    let mut routers = vec![
        make_router(RouterConfig::default()),
        make_router(RouterConfig {
            max_transit_tunnels: 0,
            ..Default::default()
        }),
    ];
    mesh(&mut routers);
    let hop = routers[1].ident;

    let pool_id = routers[0].core.tunnels.create_pool(
        PoolOwner::Destination([5u8; 32]),
        PoolSettings {
            out_length: 1,
            out_quantity: 1,
            in_quantity: 0,
            explicit_peers: Some(vec![hop]),
            ..Default::default()
        },
    );
    let snapshot = garlicnet_netdb::NetDbSnapshot {
        routers: vec![routers[0].core.netdb.lookup_router(&hop).unwrap()],
        floodfills: vec![],
    };
    let outputs = routers[0]
        .core
        .tunnels
        .build_tunnel(pool_id, false, &snapshot, |_| true)
        .unwrap();
    for output in outputs {
        if let garlicnet_tunnel::TunnelOutput::SendDirect { to, msg } = output {
            routers[0].transports.send_message(&to, msg);
        }
    }
    pump(&mut routers);

    assert_eq!(
        routers[1].core.tunnels.transit_count(),
        0,
        "no transit tunnel created at capacity"
    );
    assert!(
        routers[0]
            .core
            .tunnels
            .pool(pool_id)
            .and_then(|p| p.next_outbound(&[], TransportSet::all(), |_| TransportSet::all()))
            .is_none(),
        "build declined with bandwidth code"
    );
    // the decline fed the hop's profile
    assert!(routers[0].core.profiles().is_bad(&hop));
}

#[test]
fn large_message_fragments_across_tunnel() {
    garlicnet_logging::init_for_tests();
    let mut routers = vec![
        make_router(RouterConfig::default()),
        make_router(RouterConfig::default()),
        make_router(RouterConfig::default()),
        make_router(RouterConfig::default()),
    ];
    mesh(&mut routers);
    let (r1, r2, r3) = (routers[1].ident, routers[2].ident, routers[3].ident);

    let pool_id = routers[0].core.tunnels.create_pool(
        PoolOwner::Destination([5u8; 32]),
        PoolSettings {
            out_length: 2,
            out_quantity: 1,
            in_quantity: 0,
            explicit_peers: Some(vec![r1, r2]),
            ..Default::default()
        },
    );
    let snapshot = garlicnet_netdb::NetDbSnapshot {
        routers: vec![
            routers[0].core.netdb.lookup_router(&r1).unwrap(),
            routers[0].core.netdb.lookup_router(&r2).unwrap(),
        ],
        floodfills: vec![],
    };
    let outputs = routers[0]
        .core
        .tunnels
        .build_tunnel(pool_id, false, &snapshot, |_| true)
        .unwrap();
    for output in outputs {
        if let garlicnet_tunnel::TunnelOutput::SendDirect { to, msg } = output {
            routers[0].transports.send_message(&to, msg);
        }
    }
    pump(&mut routers);

    // a 3 KB message needs several 1024-byte frames; the endpoint must
    // reassemble it and forward exactly one Data message to R3
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let data = I2npMessage::new(MessageType::Data, 9, &payload);
    let outputs = routers[0]
        .core
        .tunnels
        .send_blocks(
            pool_id,
            vec![TunnelMessageBlock {
                delivery: TunnelDelivery::Router { to: r3 },
                msg: data,
            }],
            &[],
        )
        .unwrap();
    let mut frames = 0;
    for output in outputs {
        if let garlicnet_tunnel::TunnelOutput::SendDirect { to, msg } = output {
            frames += 1;
            routers[0].transports.send_message(&to, msg);
        }
    }
    assert!(frames > 1, "message was fragmented across frames");

    let log = pump(&mut routers);
    let deliveries: Vec<_> = log
        .iter()
        .filter(|(from, to, ty)| {
            *from == r2 && *to == r3 && *ty == MessageType::Data
        })
        .collect();
    assert_eq!(deliveries.len(), 1, "reassembled exactly once");
}
