//! Checkpoint rotation, crash recovery and trace export

use std::fs::{self, File};
use std::path::PathBuf;
use std::time::Duration;

use arrow::array::{Array, Float64Array, StringArray, UInt64Array};
use labsweep::record::{
    ExperimentEnvelope, RecordStore, ResultRecord, RunStatus, SlotIndex, SlotStatus, SweepAxes,
};
use labsweep::thermal::ThermalTrace;
use labsweep::Error;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "labsweep-record-{name}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    dir
}

/// Two temperatures, two gate voltages, slot (0, 0, 0, 1) partially filled.
fn sample_record() -> ResultRecord {
    let mut record = ResultRecord::new(SweepAxes {
        temperatures: vec![4.0, 6.0],
        gate_voltages: vec![-0.5, 0.5],
        ..SweepAxes::default()
    });
    let slot = record.slot_mut(SlotIndex::new(0, 0, 0, 0)).unwrap();
    slot.prepare(vec![0.0, 0.5, 1.0], [("current", "A"), ("voltage", "V")], 2);
    slot.write_block(
        0,
        &[vec![1e-6, 2e-6, 3e-6], vec![0.0, 0.5, 1.0]],
        Duration::from_millis(10),
    )
    .unwrap();

    let slot = record.slot_mut(SlotIndex::new(0, 0, 0, 1)).unwrap();
    slot.prepare(vec![0.0, 0.5, 1.0], [("current", "A"), ("voltage", "V")], 2);
    slot.write_block(0, &[vec![4e-6], vec![0.1]], Duration::from_millis(10))
        .unwrap();

    record
        .set_thermalization(
            0,
            ThermalTrace {
                setpoint: 4.0,
                channels: vec!["stage".to_string()],
                time: vec![0.0, 1.0],
                readings: vec![vec![4.2, 4.05]],
                failed_reads: 0,
            },
        )
        .unwrap();
    record
}

#[test]
fn test_checkpoint_round_trip_preserves_record() {
    let dir = scratch("round-trip");
    let store = RecordStore::new(dir.join("run.json"));
    let mut envelope = ExperimentEnvelope::builder("C12", "D3")
        .config(serde_json::json!({ "settle_time_s": 1.0 }))
        .record(sample_record())
        .build();
    envelope.start();
    store.checkpoint(&envelope).unwrap();

    let loaded = RecordStore::load(store.path()).unwrap();
    assert_eq!(loaded, envelope);

    let record = loaded.record();
    assert_eq!(record.completed_slots(), 1);
    let partial = record.slot(SlotIndex::new(0, 0, 0, 1)).unwrap();
    assert_eq!(partial.status(), SlotStatus::Partial);
    assert_eq!(partial.filled(), 1);
    assert_eq!(partial.acquired("current").unwrap(), &[4e-6]);
    assert_eq!(record.thermalization(0).unwrap().last("stage"), Some(4.05));
    assert!(record.thermalization(1).is_none());
}

#[test]
fn test_crash_after_backup_rename_recovers_previous() {
    let dir = scratch("crash-rename");
    let store = RecordStore::new(dir.join("run.json"));
    let mut envelope = ExperimentEnvelope::new("C1", "D1", sample_record());
    store.checkpoint(&envelope).unwrap();
    envelope.start();
    store.checkpoint(&envelope).unwrap();

    // Crash between "target → .bak" and ".tmp → target"
    fs::write(store.temp_path(), b"{\"partial\": tru").unwrap();
    fs::remove_file(store.backup_path()).unwrap();
    fs::rename(store.path(), store.backup_path()).unwrap();
    assert!(!store.path().exists());

    let recovered = store.recover().unwrap();
    assert_eq!(recovered, envelope);
    assert_eq!(recovered.status(), RunStatus::Running);
}

#[test]
fn test_leftover_temp_file_is_ignored() {
    let dir = scratch("leftover-tmp");
    let store = RecordStore::new(dir.join("run.json"));
    let envelope = ExperimentEnvelope::new("C1", "D1", sample_record());
    store.checkpoint(&envelope).unwrap();
    fs::write(store.temp_path(), b"garbage").unwrap();

    assert_eq!(store.recover().unwrap(), envelope);

    // The next checkpoint overwrites the stale temp file
    store.checkpoint(&envelope).unwrap();
    assert!(!store.temp_path().exists());
    assert_eq!(RecordStore::load(store.path()).unwrap(), envelope);
}

#[test]
fn test_corrupt_target_falls_back_to_backup() {
    let dir = scratch("corrupt");
    let store = RecordStore::new(dir.join("run.json"));
    let envelope = ExperimentEnvelope::new("C1", "D1", sample_record());
    store.checkpoint(&envelope).unwrap();
    store.checkpoint(&envelope).unwrap();
    fs::write(store.path(), b"{ \"chip_id\": ").unwrap();

    assert!(matches!(
        RecordStore::load(store.path()),
        Err(Error::Serialization(_))
    ));
    assert_eq!(store.recover().unwrap(), envelope);
}

#[test]
fn test_recover_without_any_checkpoint_fails() {
    let dir = scratch("nothing");
    let store = RecordStore::new(dir.join("run.json"));
    assert!(matches!(store.recover(), Err(Error::Persistence { .. })));
}

#[test]
fn test_unwritable_location_is_persistence_error() {
    let dir = scratch("unwritable");
    fs::create_dir_all(&dir).unwrap();
    let blocker = dir.join("not-a-dir");
    File::create(&blocker).unwrap();
    let store = RecordStore::new(blocker.join("run.json"));

    let envelope = ExperimentEnvelope::new("C1", "D1", ResultRecord::default());
    let err = store.checkpoint(&envelope).unwrap_err();
    assert!(matches!(err, Error::Persistence { .. }));
    assert!(err.to_string().contains("not-a-dir"));
}

#[test]
fn test_finalize_stamps_status_and_exports_traces() {
    let dir = scratch("finalize");
    let export = dir.join("traces.parquet");
    let store = RecordStore::new(dir.join("run.json")).with_trace_export(&export);
    let mut envelope = ExperimentEnvelope::new("C1", "D1", sample_record());
    envelope.start();

    store.finalize(&mut envelope, RunStatus::Failed).unwrap();
    assert!(envelope.ended_at().is_some());

    let loaded = RecordStore::load(store.path()).unwrap();
    assert_eq!(loaded.status(), RunStatus::Failed);
    assert_eq!(loaded.ended_at(), envelope.ended_at());

    let file = File::open(&export).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    // Three samples in the complete slot and one in the partial one, two channels each
    assert_eq!(rows, (3 + 1) * 2);

    let batch = &batches[0];
    let channel = batch
        .column_by_name("channel")
        .unwrap()
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    assert_eq!(channel.value(0), "current");
    assert_eq!(channel.value(3), "voltage");

    let gate = batch
        .column_by_name("gate_index")
        .unwrap()
        .as_any()
        .downcast_ref::<UInt64Array>()
        .unwrap();
    assert_eq!(gate.value(6), 1);

    let value = batch
        .column_by_name("value")
        .unwrap()
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert_eq!(value.value(6), 4e-6);

    let heater = batch.column_by_name("heater_current").unwrap();
    assert_eq!(heater.null_count(), heater.len());
}
