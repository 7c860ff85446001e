//! Columnar trace export (Parquet)
//!
//! Long format: one row per acquired sample per channel. Only the filled
//! prefix of each slot is exported; pre-sized zeros never reach the file.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use super::ResultRecord;
use crate::{Error, Result};

/// Schema of the exported trace table.
#[must_use]
pub fn trace_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("temperature_index", DataType::UInt64, false),
        Field::new("heater_index", DataType::UInt64, false),
        Field::new("frequency_index", DataType::UInt64, false),
        Field::new("gate_index", DataType::UInt64, false),
        Field::new("temperature", DataType::Float64, true),
        Field::new("heater_current", DataType::Float64, true),
        Field::new("frequency", DataType::Float64, true),
        Field::new("gate_voltage", DataType::Float64, true),
        Field::new("sample", DataType::UInt64, false),
        Field::new("time", DataType::Float64, false),
        Field::new("setpoint", DataType::Float64, false),
        Field::new("channel", DataType::Utf8, false),
        Field::new("unit", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("mean", DataType::Float64, false),
        Field::new("std", DataType::Float64, false),
    ]))
}

#[derive(Default)]
struct Columns {
    indices: [Vec<u64>; 4],
    coordinates: [Vec<Option<f64>>; 4],
    sample: Vec<u64>,
    time: Vec<f64>,
    setpoint: Vec<f64>,
    channel: Vec<String>,
    unit: Vec<String>,
    value: Vec<f64>,
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Columns {
    fn into_batch(self) -> Result<RecordBatch> {
        let [ti, hi, fi, gi] = self.indices;
        let [t, h, f, g] = self.coordinates;
        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(ti)),
            Arc::new(UInt64Array::from(hi)),
            Arc::new(UInt64Array::from(fi)),
            Arc::new(UInt64Array::from(gi)),
            Arc::new(Float64Array::from(t)),
            Arc::new(Float64Array::from(h)),
            Arc::new(Float64Array::from(f)),
            Arc::new(Float64Array::from(g)),
            Arc::new(UInt64Array::from(self.sample)),
            Arc::new(Float64Array::from(self.time)),
            Arc::new(Float64Array::from(self.setpoint)),
            Arc::new(StringArray::from(self.channel)),
            Arc::new(StringArray::from(self.unit)),
            Arc::new(Float64Array::from(self.value)),
            Arc::new(Float64Array::from(self.mean)),
            Arc::new(Float64Array::from(self.std)),
        ];
        Ok(RecordBatch::try_new(trace_schema(), columns)?)
    }
}

/// Flatten the acquired samples of `record` into one record batch.
///
/// # Errors
///
/// Returns [`Error::Arrow`] if the batch cannot be assembled.
pub fn trace_batch(record: &ResultRecord) -> Result<RecordBatch> {
    let mut columns = Columns::default();
    for (index, slot) in record.iter() {
        let coordinates = record.coordinates(index);
        let position = [index.temperature, index.heater, index.frequency, index.gate];
        let values = [
            coordinates.temperature,
            coordinates.heater_current,
            coordinates.frequency,
            coordinates.gate_voltage,
        ];
        for trace in slot.channels() {
            for sample in 0..slot.filled() {
                for (column, &p) in columns.indices.iter_mut().zip(&position) {
                    column.push(p as u64);
                }
                for (column, &v) in columns.coordinates.iter_mut().zip(&values) {
                    column.push(v);
                }
                columns.sample.push(sample as u64);
                columns.time.push(slot.time()[sample]);
                columns.setpoint.push(slot.setpoints()[sample]);
                columns.channel.push(trace.name.clone());
                columns.unit.push(trace.unit.clone());
                columns.value.push(trace.values[sample]);
                columns.mean.push(trace.mean[sample]);
                columns.std.push(trace.std[sample]);
            }
        }
    }
    columns.into_batch()
}

/// Write the acquired samples of `record` to a Parquet file.
///
/// Returns the number of rows written.
///
/// # Errors
///
/// Returns [`Error::Persistence`] if the file cannot be created, or
/// [`Error::Arrow`]/[`Error::Parquet`] if encoding fails.
pub fn export_traces(record: &ResultRecord, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let batch = trace_batch(record)?;
    let rows = batch.num_rows();

    let file = File::create(path).map_err(|source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(rows)
}
