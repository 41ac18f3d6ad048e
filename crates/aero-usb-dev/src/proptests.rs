use std::sync::Arc;

use proptest::prelude::*;

use crate::broker::{RefCore, RefLevel, RefSnapshot};
use crate::config::UsbDevConfig;
use crate::device::{DeviceKey, Endpoint, UsbDevice, UsbDeviceDesc};
use crate::location::{AccessMode, DevLocation};
use crate::session::Session;

const MAX_OPS: usize = 64;
const MAX_HELD: usize = 16;

#[derive(Debug, Clone)]
enum Op {
    Acquire { session: usize, level: RefLevel },
    Release { pick: usize },
    ReleaseTwice { pick: usize },
    Upgrade { pick: usize },
}

fn level_strategy() -> impl Strategy<Value = RefLevel> {
    prop_oneof![
        Just(RefLevel::Fifo),
        Just(RefLevel::Device),
        Just(RefLevel::AnyState),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3, level_strategy())
            .prop_map(|(session, level)| Op::Acquire { session, level }),
        3 => any::<usize>().prop_map(|pick| Op::Release { pick }),
        1 => any::<usize>().prop_map(|pick| Op::ReleaseTwice { pick }),
        1 => any::<usize>().prop_map(|pick| Op::Upgrade { pick }),
    ]
}

struct Fixture {
    core: RefCore,
    key: DeviceKey,
    sessions: Vec<Session>,
}

/// A device with two opened endpoint sessions (read+write and read-only) and one session that
/// owns nothing, so some acquisitions fail part way.
fn fixture() -> Fixture {
    let core = RefCore::new(UsbDevConfig {
        max_buses: 1,
        max_devices: 2,
        fifo_max: 8,
        ..UsbDevConfig::default()
    });
    let key = DeviceKey { bus: 0, dev: 1 };
    let endpoints = [0x81, 0x01, 0x82]
        .into_iter()
        .map(|address| Endpoint {
            address,
            iface_index: 0,
        })
        .collect();
    core.insert_device(Arc::new(UsbDevice::new(
        key,
        UsbDeviceDesc {
            endpoints,
            ..UsbDeviceDesc::default()
        },
    )))
    .unwrap();

    let mut sessions = Vec::new();
    for (ep, access) in [
        (1, AccessMode::READ | AccessMode::WRITE),
        (2, AccessMode::READ),
    ] {
        let mut s = Session::new(core.next_session_id(), DevLocation::endpoint(0, 1, ep));
        let mut snap = core.acquire(&s, RefLevel::Device).unwrap();
        s.set_access(access);
        core.fifo_create(&mut s, &mut snap).unwrap();
        if let Some(tx) = &snap.txfifo {
            core.fifo_open(tx, s.id()).unwrap();
        }
        if let Some(rx) = &snap.rxfifo {
            core.fifo_open(rx, s.id()).unwrap();
        }
        core.release(&mut snap);
        sessions.push(s);
    }
    let mut stranger = Session::new(core.next_session_id(), DevLocation::endpoint(0, 1, 1));
    stranger.set_access(AccessMode::READ);
    sessions.push(stranger);

    Fixture {
        core,
        key,
        sessions,
    }
}

fn fifo_refcounts(fx: &Fixture) -> Vec<u32> {
    (0..fx.core.config.fifo_max)
        .filter_map(|slot| fx.core.fifo(fx.key, slot))
        .map(|fifo| fifo.refcount())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matched_acquire_release_restores_refcounts(
        ops in proptest::collection::vec(op_strategy(), 0..MAX_OPS),
    ) {
        let fx = fixture();
        let dev_baseline = fx.core.device_refcount(fx.key);
        let fifo_baseline = fifo_refcounts(&fx);
        let mut held: Vec<(usize, RefSnapshot)> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire { session, level } => {
                    if held.len() == MAX_HELD {
                        continue;
                    }
                    if let Ok(snap) = fx.core.acquire(&fx.sessions[session], level) {
                        held.push((session, snap));
                    }
                }
                Op::Release { pick } if !held.is_empty() => {
                    let (_, mut snap) = held.remove(pick % held.len());
                    fx.core.release(&mut snap);
                }
                Op::ReleaseTwice { pick } if !held.is_empty() => {
                    let (_, mut snap) = held.remove(pick % held.len());
                    fx.core.release(&mut snap);
                    fx.core.release(&mut snap);
                }
                Op::Upgrade { pick } if !held.is_empty() => {
                    let idx = pick % held.len();
                    let session = held[idx].0;
                    if fx.core.upgrade(&fx.sessions[session], &mut held[idx].1).is_err() {
                        held.remove(idx);
                    }
                }
                _ => {}
            }
        }
        for (_, mut snap) in held.drain(..) {
            fx.core.release(&mut snap);
        }

        prop_assert_eq!(fx.core.device_refcount(fx.key), dev_baseline);
        prop_assert_eq!(fifo_refcounts(&fx), fifo_baseline);
    }
}
