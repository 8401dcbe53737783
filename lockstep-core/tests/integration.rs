//! Integration tests: admission handshake, lockstep iterations and
//! departures between real sessions over loopback UDP.
//!
//! Both sides run inside one task via `tokio::join!`, the same way a
//! single-threaded application would interleave them.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use lockstep_core::{
    ConnectionPhase, Host, IterationActions, Session, SessionEvents, SyncConfig, SyncError, Value,
};
use rand::RngCore;
use tokio_test::assert_ok;

// ── Helpers ──────────────────────────────────────────────────────

/// Records every event by name.
#[derive(Debug, Default)]
struct Recorder {
    log: Vec<String>,
}

impl Recorder {
    fn count(&self, event: &str) -> usize {
        self.log.iter().filter(|e| *e == event).count()
    }
}

impl SessionEvents for Recorder {
    fn host_added(&mut self, _host: &Host) {
        self.log.push("host_added".into());
    }
    fn host_removed(&mut self, _host: &Host) {
        self.log.push("host_removed".into());
    }
    fn host_connected(&mut self, _host: &Host, _address: SocketAddr) {
        self.log.push("host_connected".into());
    }
    fn new_connector(&mut self, _name: &str, _address: SocketAddr) {
        self.log.push("new_connector".into());
    }
    fn connector_ready(&mut self, _name: &str, _address: SocketAddr) {
        self.log.push("connector_ready".into());
    }
    fn got_first_connection(&mut self) {
        self.log.push("got_first_connection".into());
    }
    fn in_network(&mut self) {
        self.log.push("in_network".into());
    }
    fn hosting_new_host(&mut self, _host: &Host) {
        self.log.push("hosting_new_host".into());
    }
    fn protocol_violation(&mut self, _error: &SyncError) {
        self.log.push("protocol_violation".into());
    }
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        recv_timeout_ms: 50,
        handshake_timeout_ms: 50,
        admission_timeout_ms: 5_000,
        ..Default::default()
    }
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("timeout")
}

/// A started listener on an OS-assigned port, plus the loopback address
/// connectors should use.
async fn started_listener() -> (Session<Recorder>, SocketAddr) {
    let mut listener = Session::listener(
        fast_config(),
        "alice",
        0,
        Value::str("worms"),
        Recorder::default(),
    );
    assert_ok!(listener.start_connecting().await);
    let port = listener.rendezvous_addr().unwrap().port();
    (listener, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

struct Pair {
    listener: Session<Recorder>,
    connector: Session<Recorder>,
    /// Listener iteration count right after executing the admission.
    admitted_at: u64,
}

/// Tick until `hosts` hosts are seated, then once more, which sends the
/// first datagram the newcomer is waiting for. Returns the iteration count
/// right after the admission executed.
async fn tick_until_seated(session: &mut Session<Recorder>, hosts: usize) -> Result<u64, SyncError> {
    while session.engine().host_ids().len() < hosts {
        session.update().await?;
        session.iteration_actions();
    }
    let admitted_at = session.engine().iteration_count();
    session.update().await?;
    session.iteration_actions();
    Ok(admitted_at)
}

/// Run a connector's handshake until it is in the network.
async fn join_network(session: &mut Session<Recorder>) -> Result<(), SyncError> {
    session.start_connecting().await?;
    while !session.is_in_network() {
        session.update().await?;
    }
    Ok(())
}

/// Admit one connector.
async fn join_pair() -> Pair {
    let (mut listener, addr) = started_listener().await;
    let mut connector = Session::connector(fast_config(), "bob", addr, Recorder::default());

    let (admitted_at, joined) = within(async {
        tokio::join!(
            tick_until_seated(&mut listener, 2),
            join_network(&mut connector)
        )
    })
    .await;
    joined.unwrap();
    Pair {
        listener,
        connector,
        admitted_at: admitted_at.unwrap(),
    }
}

/// Tick `session` until its iteration count reaches `end`, enqueueing
/// `base + iteration` on every host each tick.
async fn run_until(
    session: &mut Session<Recorder>,
    end: u64,
    base: i64,
) -> Result<Vec<(u64, IterationActions)>, SyncError> {
    let mut log = Vec::new();
    while session.engine().iteration_count() < end {
        let iteration = session.engine().iteration_count();
        session
            .engine_mut()
            .run_action_on_all("tick", vec![Value::from(base + iteration as i64)])?;
        session.update().await?;
        log.push((iteration, session.iteration_actions()));
    }
    Ok(log)
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_agrees_on_hosts_and_clock() {
    let pair = join_pair().await;
    let (listener, connector) = (&pair.listener, &pair.connector);

    assert_eq!(listener.engine().host_ids(), connector.engine().host_ids());
    assert_eq!(listener.engine().host_ids().len(), 2);
    assert_eq!(connector.engine().iteration_count(), pair.admitted_at);
    assert!(connector.is_in_network());
    assert_eq!(connector.publicized_data().unwrap(), &Value::str("worms"));

    let names: Vec<_> = connector
        .engine()
        .hosts()
        .map(|h| h.name.clone())
        .collect();
    let mut expected = vec!["alice".to_string(), "bob".to_string()];
    if listener.engine().local_host().id > connector.engine().local_host().id {
        expected.reverse();
    }
    assert_eq!(names, expected);

    let l = listener.engine().events();
    assert_eq!(l.count("new_connector"), 1);
    assert_eq!(l.count("connector_ready"), 1);
    assert_eq!(l.count("hosting_new_host"), 1);
    assert_eq!(l.count("host_connected"), 1);

    let c = connector.engine().events();
    assert_eq!(c.count("got_first_connection"), 1);
    assert_eq!(c.count("in_network"), 1);
    assert_eq!(c.count("host_connected"), 1);
    assert_eq!(c.count("host_added"), 2);
}

#[tokio::test]
async fn test_version_mismatch_fails_both_sides() {
    let (mut listener, addr) = started_listener().await;
    let config = SyncConfig {
        protocol_version: 2,
        ..fast_config()
    };
    let mut connector = Session::connector(config, "bob", addr, Recorder::default());

    let listener_side = async {
        loop {
            if let Err(e) = listener.update().await {
                return e;
            }
            listener.iteration_actions();
        }
    };
    let (listener_err, connector_result) =
        within(async { tokio::join!(listener_side, connector.start_connecting()) }).await;

    assert!(matches!(
        listener_err,
        SyncError::VersionMismatch {
            local: 1,
            remote: 2
        }
    ));
    assert!(matches!(
        connector_result,
        Err(SyncError::ConnectionFailed(_))
    ));
    assert_eq!(listener.engine().events().count("protocol_violation"), 1);
    assert_eq!(*listener.phase(), ConnectionPhase::Listening);
    assert_eq!(listener.engine().host_ids().len(), 1);
    assert!(connector.phase().is_idle());
}

#[tokio::test]
async fn test_stop_during_negotiation_rejects_connector() {
    let (mut listener, addr) = started_listener().await;
    let mut connector = Session::connector(fast_config(), "bob", addr, Recorder::default());

    let listener_side = async {
        while !listener.is_negotiating() {
            listener.update().await?;
            listener.iteration_actions();
        }
        listener.stop_connecting().await
    };
    let (stopped, connector_result) =
        within(async { tokio::join!(listener_side, connector.start_connecting()) }).await;

    assert_ok!(stopped);
    assert!(matches!(
        connector_result,
        Err(SyncError::ConnectionFailed(_))
    ));
    assert!(listener.is_in_network());
    assert!(listener.rendezvous_addr().is_none());
    assert_eq!(listener.engine().host_ids().len(), 1);
    assert!(connector.publicized_data().is_err());
}

#[tokio::test]
async fn test_pair_stops_admitting_together() {
    let Pair {
        mut listener,
        mut connector,
        admitted_at,
    } = join_pair().await;
    let port = listener.rendezvous_addr().unwrap().port();

    assert_ok!(listener.stop_connecting().await);
    assert_ok!(connector.stop_connecting().await);
    assert!(!listener.engine().is_accepting_peers());
    assert!(!connector.engine().is_accepting_peers());

    let late_config = SyncConfig {
        attempt_count: 2,
        ..fast_config()
    };
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut late = Session::connector(late_config, "carol", addr, Recorder::default());
    assert!(within(late.start_connecting()).await.is_err());

    let end = admitted_at + 11;
    let (l, c) = within(async {
        tokio::join!(
            run_until(&mut listener, end, 0),
            run_until(&mut connector, end, 1_000)
        )
    })
    .await;
    let first = admitted_at + 1;
    let from_first = |log: Vec<(u64, IterationActions)>| -> Vec<(u64, IterationActions)> {
        log.into_iter().filter(|(i, _)| *i >= first).collect()
    };
    assert_eq!(from_first(l.unwrap()), from_first(c.unwrap()));
    assert_eq!(listener.engine().host_ids().len(), 2);
    assert_eq!(connector.engine().host_ids(), listener.engine().host_ids());
}

// ── Lockstep ─────────────────────────────────────────────────────

const TICKS: u64 = 100;

#[tokio::test]
async fn test_both_sides_see_identical_iterations() {
    let Pair {
        mut listener,
        mut connector,
        admitted_at,
    } = join_pair().await;

    // The listener already ran iteration `admitted_at`; compare from the
    // first iteration both sides execute in this loop.
    let first = admitted_at + 1;
    let end = first + TICKS;

    let (l, c) = within(async {
        tokio::join!(
            run_until(&mut listener, end, 1_000),
            run_until(&mut connector, end, 2_000_000)
        )
    })
    .await;
    let l = l.unwrap();
    let c = c.unwrap();

    let l: Vec<_> = l.into_iter().filter(|(i, _)| *i >= first).collect();
    let c: Vec<_> = c.into_iter().filter(|(i, _)| *i >= first).collect();
    assert_eq!(l.len() as u64, TICKS);
    assert_eq!(l, c);

    // Every iteration after the first carries one tick from each side.
    for (iteration, actions) in l.iter().skip(1) {
        assert_eq!(actions.len(), 2, "iteration {iteration}");
        let ticks: usize = actions.iter().map(|(_, a)| a.len()).sum();
        assert_eq!(ticks, 2, "iteration {iteration}");
    }

    // The admission reseeded both sides identically.
    let x = listener.engine_mut().random().unwrap().next_u64();
    let y = connector.engine_mut().random().unwrap().next_u64();
    assert_eq!(x, y);
}

#[tokio::test]
async fn test_third_host_joins_existing_pair() {
    let Pair {
        mut listener,
        mut connector,
        ..
    } = join_pair().await;
    let port = listener.rendezvous_addr().unwrap().port();
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut third = Session::connector(fast_config(), "carol", addr, Recorder::default());

    // Both seated hosts execute the admission at the same iteration and
    // connect back to the newcomer's ports in host id order.
    let (a, b, c) = within(async {
        tokio::join!(
            tick_until_seated(&mut listener, 3),
            tick_until_seated(&mut connector, 3),
            join_network(&mut third)
        )
    })
    .await;
    let admitted_at = a.unwrap();
    assert_eq!(b.unwrap(), admitted_at);
    c.unwrap();
    assert_eq!(third.engine().iteration_count(), admitted_at);

    let ids = listener.engine().host_ids();
    assert_eq!(ids.len(), 3);
    assert_eq!(connector.engine().host_ids(), ids);
    assert_eq!(third.engine().host_ids(), ids);
    assert_eq!(listener.engine().events().count("hosting_new_host"), 2);
    assert_eq!(connector.engine().events().count("host_connected"), 2);
    assert_eq!(third.engine().events().count("host_connected"), 2);

    let first = admitted_at + 1;
    let end = first + 20;
    let (l, m, r) = within(async {
        tokio::join!(
            run_until(&mut listener, end, 1_000_000),
            run_until(&mut connector, end, 2_000_000),
            run_until(&mut third, end, 3_000_000)
        )
    })
    .await;
    let from_first = |log: Vec<(u64, IterationActions)>| -> Vec<(u64, IterationActions)> {
        log.into_iter().filter(|(i, _)| *i >= first).collect()
    };
    let l = from_first(l.unwrap());
    let m = from_first(m.unwrap());
    let r = from_first(r.unwrap());
    assert_eq!(l.len(), 20);
    assert_eq!(l, m);
    assert_eq!(l, r);
    for (iteration, actions) in l.iter().skip(1) {
        let ticks: usize = actions.iter().map(|(_, a)| a.len()).sum();
        assert_eq!(ticks, 3, "iteration {iteration}");
    }

    let x = listener.engine_mut().random().unwrap().next_u64();
    let y = connector.engine_mut().random().unwrap().next_u64();
    let z = third.engine_mut().random().unwrap().next_u64();
    assert_eq!(x, y);
    assert_eq!(y, z);
}

// ── Departure ────────────────────────────────────────────────────

#[tokio::test]
async fn test_goodbye_removes_host_at_the_same_iteration() {
    let Pair {
        mut listener,
        connector,
        admitted_at,
    } = join_pair().await;
    let stop_at = admitted_at + 10;

    let connector_side = async move {
        let mut connector = connector;
        run_until(&mut connector, stop_at, 0).await?;
        connector.leave().await
    };
    let listener_side = async {
        let mut last_seen = Vec::new();
        while listener.engine().host_ids().len() > 1 {
            listener.update().await?;
            let iteration = listener.engine().iteration_count() - 1;
            last_seen.push((iteration, listener.iteration_actions().len()));
        }
        Ok::<_, SyncError>(last_seen)
    };

    let (left, seen) = within(async { tokio::join!(connector_side, listener_side) }).await;
    let departed = left.unwrap();
    let seen = seen.unwrap();

    assert!(departed.count("host_added") >= 2);
    assert_eq!(listener.engine().events().count("host_removed"), 1);
    // Two contributions through the last announced iteration, then the
    // departed host is gone from the very next one.
    assert!(seen.contains(&(stop_at, 2)));
    assert_eq!(seen.last(), Some(&(stop_at + 1, 1)));
    assert_eq!(listener.engine().iteration_count(), stop_at + 2);

    // Alone again: ticks no longer wait on anyone.
    within(async {
        for _ in 0..5 {
            listener.update().await.unwrap();
        }
    })
    .await;
    assert_eq!(listener.engine().iteration_count(), stop_at + 7);
}
