//! End-to-end session lifecycle against the mock transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use timbang_core::{
    BindingStore, DeviceId, JsonFileBindingStore, LicenseKey, MockDevice, MockTransport,
    ScaleSession, Scanner, SessionPhase, Transport, WeightReading, WeightUnit,
};

const SCALE: &str = "C8:47:8C:00:12:34";

fn transport() -> Arc<MockTransport> {
    Arc::new(
        MockTransport::new()
            .with_device(MockDevice::scale(SCALE, "MI SCALE2").with_rssi(-58))
            .with_device(MockDevice::other("DE:AD:BE:EF:00:01", Some("Fitness Band"))),
    )
}

async fn wait_for(readings: &Mutex<Vec<WeightReading>>, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while readings.lock().unwrap().len() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("readings delivered");
}

#[tokio::test(start_paused = true)]
async fn scan_bind_stream_and_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let bindings = dir.path().join("bindings.json");
    let transport = transport();
    let license = LicenseKey::new("LIC-2024-0001");

    let devices = Scanner::new(Arc::clone(&transport) as Arc<dyn Transport>)
        .scan(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    let scale = devices[0].id.clone();

    {
        let store = Arc::new(JsonFileBindingStore::open(&bindings).unwrap());
        let session = ScaleSession::new(Arc::clone(&transport) as Arc<dyn Transport>, store);
        let readings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&readings);
        let token = session.subscribe(move |r| sink.lock().unwrap().push(r.clone()));

        session.connect(&license, &scale).await.unwrap();
        transport.notify(&scale, vec![0x02, 0x8C, 0x1B]).await;
        transport.notify(&scale, vec![0x03, 0x98, 0x3A]).await;
        wait_for(&readings, 2).await;

        {
            let seen = readings.lock().unwrap();
            assert!((seen[0].weight - 70.52).abs() < 1e-9);
            assert_eq!(seen[0].unit, WeightUnit::Kilograms);
            assert!(seen[0].stable);
            assert!((seen[1].weight - 150.0).abs() < 1e-9);
            assert_eq!(seen[1].unit, WeightUnit::Pounds);
        }

        assert!(token.unsubscribe());
        session.disconnect().await.unwrap();
        assert_eq!(session.status().await.phase, SessionPhase::Idle);
    }

    // A fresh process reloads the binding from disk.
    let store = Arc::new(JsonFileBindingStore::open(&bindings).unwrap());
    assert_eq!(store.get(&license).unwrap().unwrap().device_id, scale);

    let session = ScaleSession::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&store) as Arc<dyn BindingStore>,
    );
    let device = session.auto_connect(&license).await.unwrap();
    assert_eq!(device.id, DeviceId::new(SCALE));
    assert_eq!(device.name, "MI SCALE2");

    session.destroy().await;
    assert!(store.is_empty().unwrap());
    assert!(!transport.is_connected(&scale));
}
