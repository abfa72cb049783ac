mod common;
use common::*;

use powerocean_bridge::energy::{EnergyChannel, EnergyTotals};
use powerocean_bridge::ecoflow::wire::FieldWriter;
use powerocean_bridge::liveness::ConnectionState;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn pack_update_only_touches_its_slot() {
    common_setup();
    let coordinator = Factory::coordinator();

    coordinator.deliver_frame_at(
        &Factory::packs_frame(1, &[Pack::new(1, 50, 2500.0), Pack::new(2, 60, 3000.0)]),
        at(0),
    );
    let before = coordinator.snapshot();

    let delivery =
        coordinator.deliver_frame_at(&Factory::packs_frame(2, &[Pack::new(1, 80, 4000.0)]), at(10));
    assert_eq!(delivery.applied, 1);

    let after = coordinator.snapshot();
    assert_eq!(after.pack(0).unwrap().state_of_charge, 80);
    assert_eq!(after.pack(0).unwrap().remaining_energy, 4000.0);
    assert_eq!(after.pack(1), before.pack(1));
    assert_eq!(after.packs[&1].received_at, at(0));
    assert_eq!(after.total_remaining_energy, 7000.0);
    assert_eq!(after.total_soc, Some(70.0));
}

#[test]
fn remaining_energy_is_order_independent() {
    let packs = [
        Pack::new(1, 90, 4600.5),
        Pack::new(2, 40, 2048.25),
        Pack::new(3, 10, 512.125),
    ];

    let forward = Coordinator::new(
        Factory::config_yaml("device:\n  num_battery_packs: 3\n"),
        Channels::new(),
    );
    for (i, pack) in packs.iter().enumerate() {
        forward.deliver_frame_at(&Factory::packs_frame(i as u64, &[pack.clone()]), at(0));
    }

    let backward = Coordinator::new(
        Factory::config_yaml("device:\n  num_battery_packs: 3\n"),
        Channels::new(),
    );
    for (i, pack) in packs.iter().rev().enumerate() {
        backward.deliver_frame_at(&Factory::packs_frame(i as u64, &[pack.clone()]), at(0));
    }

    let expected: f64 = packs.iter().map(|p| f64::from(p.remaining_wh)).sum();
    assert_eq!(forward.snapshot().total_remaining_energy, expected);
    assert_eq!(backward.snapshot().total_remaining_energy, expected);
    assert_eq!(forward.snapshot().active_pack_count, 3);
    assert_eq!(forward.snapshot().missing_pack_count(), 0);
}

#[test]
fn truncated_payload_costs_only_its_header() {
    common_setup();
    let coordinator = Factory::coordinator();

    let stream = Factory::energy_stream(1000.0, 0.0, 0.0, 1000.0);
    let raw = Factory::frame(vec![
        Factory::header(7, 5, &Factory::battery_status(&[Pack::new(1, 50, 2500.0)])),
        // cut into the middle of a fixed32 value
        Factory::header(33, 6, &stream[..stream.len() - 3]),
    ]);

    let delivery = coordinator.deliver_frame_at(&raw, at(0));
    assert!(!delivery.frame_dropped);
    assert_eq!(delivery.headers, 2);
    assert_eq!(delivery.applied, 1);
    assert_eq!(delivery.malformed_payloads, 1);

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.pack(0).unwrap().state_of_charge, 50);
    assert!(snapshot.energy_stream.is_none());

    let stats = coordinator.stats.lock().unwrap();
    assert_eq!(stats.payloads_dropped, 1);
    assert_eq!(stats.frames_dropped, 0);
}

#[test]
fn truncated_header_costs_only_that_header() {
    common_setup();
    let coordinator = Factory::coordinator();

    let good = Factory::header(7, 5, &Factory::battery_status(&[Pack::new(2, 75, 3500.0)]));
    let bad = Factory::header(33, 6, &Factory::energy_stream(1.0, 2.0, 3.0, 4.0)).encode();

    let raw = FieldWriter::new()
        .bytes(1, &good.encode())
        .bytes(1, &bad[..bad.len() / 2])
        .finish();

    let delivery = coordinator.deliver_frame_at(&raw, at(0));
    assert_eq!(delivery.applied, 1);
    assert_eq!(delivery.malformed_payloads, 1);
    assert_eq!(coordinator.snapshot().pack(1).unwrap().state_of_charge, 75);
}

#[test]
fn malformed_frame_is_dropped_and_next_frame_still_folds() {
    common_setup();
    let coordinator = Factory::coordinator();

    let delivery = coordinator.deliver_frame_at(&[0x0a, 0xff, 0xff], at(0));
    assert!(delivery.frame_dropped);
    assert_eq!(*coordinator.snapshot(), *Factory::coordinator().snapshot());

    let delivery = coordinator.deliver_frame_at(&Factory::packs_frame(1, &[Pack::new(1, 20, 1000.0)]), at(1));
    assert_eq!(delivery.applied, 1);

    let stats = coordinator.stats.lock().unwrap();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.battery_reports_received, 1);
}

#[test]
fn unknown_types_change_nothing() {
    common_setup();
    let coordinator = Factory::coordinator();
    coordinator.deliver_frame_at(&Factory::stream_frame(1, 500.0, 0.0, 0.0, 500.0), at(0));
    coordinator.deliver_frame_at(&Factory::stream_frame(2, 500.0, 0.0, 0.0, 500.0), at(60));

    let snapshot = coordinator.snapshot();
    let totals = coordinator.energy_totals();
    let updates = coordinator.subscribe();

    let raw = Factory::frame(vec![
        Factory::header(99, 3, &[0x08, 0x01]),
        powerocean_bridge::ecoflow::Header::encrypted(32, 7, 4, &[0x08, 0x01]),
    ]);
    let delivery = coordinator.deliver_frame_at(&raw, at(120));

    assert_eq!(delivery.unknown, 2);
    assert_eq!(delivery.applied, 0);
    assert_eq!(*coordinator.snapshot(), *snapshot);
    assert_eq!(coordinator.energy_totals(), totals);
    assert!(!updates.has_changed().unwrap());
}

#[test]
fn empty_payload_is_skipped() {
    let coordinator = Factory::coordinator();
    let raw = Factory::frame(vec![Factory::header(7, 1, &[])]);

    let delivery = coordinator.deliver_frame_at(&raw, at(0));
    assert_eq!(delivery.empty, 1);
    assert_eq!(delivery.malformed_payloads, 0);
    assert!(coordinator.snapshot().packs.is_empty());
}

#[test]
fn older_reading_is_stale() {
    let coordinator = Factory::coordinator();

    coordinator.deliver_frame_at(&Factory::packs_frame(1, &[Pack::new(1, 60, 3000.0)]), at(10));
    let delivery =
        coordinator.deliver_frame_at(&Factory::packs_frame(2, &[Pack::new(1, 10, 500.0)]), at(5));

    assert_eq!(delivery.applied, 0);
    assert_eq!(delivery.stale, 1);
    assert_eq!(coordinator.snapshot().pack(0).unwrap().state_of_charge, 60);
    assert_eq!(coordinator.stats.lock().unwrap().stale_readings, 1);
}

#[test]
fn packs_age_out_on_refresh() {
    let coordinator = Factory::coordinator();
    coordinator.deliver_frame_at(
        &Factory::packs_frame(1, &[Pack::new(1, 60, 3000.0), Pack::new(2, 40, 2000.0)]),
        at(0),
    );
    assert_eq!(coordinator.snapshot().active_pack_count, 2);

    coordinator.deliver_frame_at(&Factory::packs_frame(2, &[Pack::new(2, 41, 2010.0)]), at(200));
    coordinator.refresh(at(301));

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.active_pack_count, 1);
    assert_eq!(snapshot.missing_pack_count(), 1);
    // last known values are kept
    assert_eq!(snapshot.pack(0).unwrap().state_of_charge, 60);
}

#[test]
fn liveness_follows_transport_events() {
    let coordinator = Factory::coordinator();
    let mut state = coordinator.subscribe_connection();

    assert!(!coordinator.connected());
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);

    coordinator.on_connect();
    assert!(coordinator.connected());
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    // repeated connect is not a transition
    coordinator.on_connect();
    assert!(!state.has_changed().unwrap());

    coordinator.on_disconnect();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);

    let stats = coordinator.stats.lock().unwrap();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.disconnects, 1);
}

#[tokio::test]
async fn subscribers_see_each_fold() -> Result<()> {
    let coordinator = Factory::coordinator();
    let mut updates = coordinator.subscribe();

    let waiter = tokio::spawn(async move {
        updates.changed().await?;
        let snapshot = updates.borrow_and_update().clone();
        Ok::<_, anyhow::Error>(snapshot)
    });

    tokio::task::yield_now().await;
    coordinator.deliver_frame_at(&Factory::packs_frame(1, &[Pack::new(1, 33, 1500.0)]), at(0));

    let snapshot = waiter.await??;
    assert_eq!(snapshot.pack(0).unwrap().state_of_charge, 33);
    assert_eq!(snapshot.updated_at, Some(at(0)));

    Ok(())
}

#[test]
fn energy_stream_feeds_accumulator() {
    let coordinator = Factory::coordinator();

    coordinator.deliver_frame_at(&Factory::stream_frame(1, 1000.0, -500.0, 0.0, 500.0), at(0));
    coordinator.deliver_frame_at(&Factory::stream_frame(2, 1000.0, -500.0, 0.0, 500.0), at(360));

    assert!(close(coordinator.cumulative(EnergyChannel::Solar), 0.1));
    assert!(close(coordinator.cumulative(EnergyChannel::GridExport), 0.05));
    assert_eq!(coordinator.cumulative(EnergyChannel::GridImport), 0.0);
    assert!(close(coordinator.cumulative(EnergyChannel::Load), 0.05));
    assert_eq!(coordinator.cumulative(EnergyChannel::BatteryCharge), 0.0);
    assert_eq!(coordinator.energy_totals().get(EnergyChannel::Solar), coordinator.cumulative(EnergyChannel::Solar));
}

#[test]
fn heartbeat_also_feeds_accumulator() {
    let coordinator = Factory::coordinator();

    for (i, secs) in [0, 180, 360].into_iter().enumerate() {
        let raw = Factory::frame(vec![Factory::header(1, i as u64, &Factory::heartbeat(600.0, 300.0, -300.0))]);
        coordinator.deliver_frame_at(&raw, at(secs));
    }

    // 600 W pv, 300 W import, 300 W into the battery for 6 minutes
    assert!(close(coordinator.cumulative(EnergyChannel::Solar), 0.06));
    assert!(close(coordinator.cumulative(EnergyChannel::GridImport), 0.03));
    assert!(close(coordinator.cumulative(EnergyChannel::BatteryCharge), 0.03));
    assert!(close(coordinator.cumulative(EnergyChannel::Load), 0.06));
    assert_eq!(coordinator.stats.lock().unwrap().heartbeats_received, 3);
}

#[test]
fn restart_restores_without_back_fill() {
    let mut persisted = EnergyTotals::default();
    persisted.set(EnergyChannel::Solar, 5.0);

    let coordinator = Factory::coordinator();
    coordinator.restore(&persisted);
    assert_eq!(coordinator.cumulative(EnergyChannel::Solar), 5.0);

    // first sample after restart only arms the channel
    coordinator.deliver_frame_at(&Factory::stream_frame(1, 2000.0, 0.0, 0.0, 0.0), at(1000));
    assert_eq!(coordinator.cumulative(EnergyChannel::Solar), 5.0);

    coordinator.deliver_frame_at(&Factory::stream_frame(2, 0.0, 0.0, 0.0, 0.0), at(1180));
    assert!(close(coordinator.cumulative(EnergyChannel::Solar), 5.1));
}

#[test]
fn hour_between_samples_is_integrated() {
    let coordinator = Factory::coordinator();

    coordinator.deliver_frame_at(&Factory::stream_frame(1, 100.0, 0.0, 0.0, 0.0), at(0));
    coordinator.deliver_frame_at(&Factory::stream_frame(2, 100.0, 0.0, 0.0, 0.0), at(3600));

    assert!(close(coordinator.cumulative(EnergyChannel::Solar), 0.1));
}

#[test]
fn configured_max_gap_skips_long_silence() {
    let coordinator = Coordinator::new(
        Factory::config_yaml("energy:\n  max_gap_secs: 600\n"),
        Channels::new(),
    );

    coordinator.deliver_frame_at(&Factory::stream_frame(1, 3000.0, 0.0, 0.0, 0.0), at(0));
    coordinator.deliver_frame_at(&Factory::stream_frame(2, 3000.0, 0.0, 0.0, 0.0), at(3600));
    assert_eq!(coordinator.cumulative(EnergyChannel::Solar), 0.0);

    coordinator.deliver_frame_at(&Factory::stream_frame(3, 3000.0, 0.0, 0.0, 0.0), at(3720));
    assert!(close(coordinator.cumulative(EnergyChannel::Solar), 0.1));
}

#[test]
fn counting_survives_poisoned_stats() {
    let coordinator = Factory::coordinator();

    let stats = coordinator.stats.clone();
    let _ = std::thread::spawn(move || {
        let _guard = stats.lock().unwrap();
        panic!("poison the stats lock");
    })
    .join();
    assert!(coordinator.stats.is_poisoned());

    coordinator.deliver_frame_at(&Factory::packs_frame(1, &[Pack::new(1, 20, 1000.0)]), at(0));
    coordinator.on_connect();

    let stats = coordinator
        .stats
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.battery_reports_received, 1);
    assert_eq!(stats.connects, 1);
}
