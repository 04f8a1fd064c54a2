//! Task execution. One call per assignment: fetch the input, run the
//! named workload over it, write output back to the store and assemble
//! the report, with per-phase timings throughout.
//!
//! Mappers read only their byte range of the input object and leave one
//! framed partition file per reducer behind. Reducers pull the
//! references they were handed, group by key and write a single output
//! object. A simple task is both halves in one go.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use tracing::info;

use common::codec;
use common::minio::{self, BucketKey, Client};
use common::{ihash, KeyValue, Workload};

use crate::core::orchestrator::{
    ObjectRef, TaskAssignment, TaskKind, TaskReport, TaskStatus, TaskTimings,
};

enum Output {
    /// A single output reference or value.
    Value(String),
    /// One output reference per partition.
    Partitions(Vec<ObjectRef>),
}

/// Everything task execution needs besides the assignment itself.
pub struct ExecutionContext {
    storage: Client,
    root: BucketKey,
}

impl ExecutionContext {
    pub fn new(storage: Client, root: BucketKey) -> Self {
        Self { storage, root }
    }

    /// Run one assignment to completion and build its report. Failures
    /// become error reports; nothing here takes the worker down.
    pub async fn execute(&self, assignment: TaskAssignment) -> TaskReport {
        let client_id = assignment.client_id;
        let task_id = assignment.task_id;
        info!("task {} started ({})", task_id, assignment.code);

        let mut timer = Timer::start();
        let result = self.run(assignment, &mut timer).await;
        let timings = Some(timer.finish());

        match result {
            Ok(Output::Value(value)) => {
                info!("task {} finished", task_id);
                TaskReport {
                    client_id,
                    task_id,
                    status: TaskStatus::Done as i32,
                    outputs: Vec::new(),
                    value,
                    error: String::new(),
                    timings,
                }
            }
            Ok(Output::Partitions(outputs)) => {
                info!("task {} finished with {} partitions", task_id, outputs.len());
                TaskReport {
                    client_id,
                    task_id,
                    status: TaskStatus::Done as i32,
                    outputs,
                    value: String::new(),
                    error: String::new(),
                    timings,
                }
            }
            Err(err) => {
                info!("task {} failed: {err:#}", task_id);
                TaskReport {
                    client_id,
                    task_id,
                    status: TaskStatus::Error as i32,
                    outputs: Vec::new(),
                    value: String::new(),
                    error: format!("{err:#}"),
                    timings,
                }
            }
        }
    }

    async fn run(&self, assignment: TaskAssignment, timer: &mut Timer) -> Result<Output> {
        let kind = TaskKind::try_from(assignment.kind)
            .map_err(|_| anyhow!("unknown task kind {}", assignment.kind))?;
        match kind {
            TaskKind::Simple => self.run_simple(assignment, timer).await,
            TaskKind::Mapper => self.run_mapper(assignment, timer).await,
            TaskKind::Reducer => self.run_reducer(assignment, timer).await,
        }
    }

    /// Map and reduce in one pass over a whole input object.
    async fn run_simple(&self, assignment: TaskAssignment, timer: &mut Timer) -> Result<Output> {
        let workload = named_workload(&assignment.code)?;
        let input = minio::path_to_bucket_key(&assignment.input)?;

        let read = Instant::now();
        let data = self.storage.get_object(&input.bucket, &input.key).await?;
        timer.read_secs = read.elapsed().as_secs_f64();

        let exec = Instant::now();
        let record = KeyValue::new(Bytes::from(assignment.input.clone()), data);
        let pairs = (workload.map_fn)(record, Bytes::new())?;
        let mut groups: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
        for pair in pairs {
            let pair = pair?;
            groups.entry(pair.key).or_default().push(pair.value);
        }
        let out = reduce_groups(&workload, groups)?;
        timer.exec_secs = exec.elapsed().as_secs_f64();

        let write = Instant::now();
        let key = self.task_key(assignment.client_id, assignment.task_id, "out");
        self.storage
            .put_object(&self.root.bucket, &key, out)
            .await?;
        timer.write_secs = write.elapsed().as_secs_f64();

        Ok(Output::Value(minio::object_url(&self.root.bucket, &key)))
    }

    /// Map this worker's byte range of the input into one partition file
    /// per reducer.
    async fn run_mapper(&self, assignment: TaskAssignment, timer: &mut Timer) -> Result<Output> {
        let workload = named_workload(&assignment.code)?;
        let input = minio::path_to_bucket_key(&assignment.input)?;
        let num_reducers = assignment.num_reducers.max(1);

        let read = Instant::now();
        let size = self.storage.object_size(&input.bucket, &input.key).await?;
        let (offset, len) = byte_range(
            size,
            u64::from(assignment.num_mappers.max(1)),
            u64::from(assignment.worker_index),
        );
        let data = self
            .storage
            .get_object_range(&input.bucket, &input.key, offset, len)
            .await?;
        timer.read_secs = read.elapsed().as_secs_f64();

        let exec = Instant::now();
        let record = KeyValue::new(Bytes::from(assignment.input.clone()), data);
        let pairs = (workload.map_fn)(record, Bytes::new())?;
        let mut buffers: Vec<BytesMut> = (0..num_reducers).map(|_| BytesMut::new()).collect();
        for pair in pairs {
            let pair = pair?;
            let partition = ihash(&pair.key) % num_reducers;
            codec::write_record(&mut buffers[partition as usize], &pair);
        }
        timer.exec_secs = exec.elapsed().as_secs_f64();

        // Every partition is written, empty or not, so reducers always
        // find a complete input set.
        let write = Instant::now();
        let mut outputs = Vec::with_capacity(buffers.len());
        for (partition, buffer) in buffers.into_iter().enumerate() {
            let leaf = format!("map/{}-{}", assignment.worker_index, partition);
            let key = self.task_key(assignment.client_id, assignment.task_id, &leaf);
            self.storage
                .put_object(&self.root.bucket, &key, buffer.freeze())
                .await?;
            outputs.push(ObjectRef {
                partition: partition as u32,
                url: minio::object_url(&self.root.bucket, &key),
            });
        }
        timer.write_secs = write.elapsed().as_secs_f64();

        Ok(Output::Partitions(outputs))
    }

    /// Fetch the handed references, group by key and reduce into a
    /// single output object.
    async fn run_reducer(&self, assignment: TaskAssignment, timer: &mut Timer) -> Result<Output> {
        let workload = named_workload(&assignment.code)?;

        let read = Instant::now();
        let mut records: Vec<KeyValue> = Vec::new();
        for input in &assignment.inputs {
            let location = minio::path_to_bucket_key(&input.url)?;
            let data = self
                .storage
                .get_object(&location.bucket, &location.key)
                .await?;
            records.extend(codec::read_records(data)?);
        }
        timer.read_secs = read.elapsed().as_secs_f64();

        let exec = Instant::now();
        let mut groups: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
        for record in records {
            groups.entry(record.key).or_default().push(record.value);
        }
        let out = reduce_groups(&workload, groups)?;
        timer.exec_secs = exec.elapsed().as_secs_f64();

        let write = Instant::now();
        let leaf = format!("reduce/{}", assignment.worker_index);
        let key = self.task_key(assignment.client_id, assignment.task_id, &leaf);
        self.storage
            .put_object(&self.root.bucket, &key, out)
            .await?;
        timer.write_secs = write.elapsed().as_secs_f64();

        Ok(Output::Value(minio::object_url(&self.root.bucket, &key)))
    }

    fn task_key(&self, client_id: u64, task_id: u64, leaf: &str) -> String {
        let prefix = if self.root.key.is_empty() {
            String::new()
        } else {
            format!("{}/", self.root.key)
        };
        format!("{prefix}{client_id}/{task_id}/{leaf}")
    }
}

/// Reduce each key group in key order and concatenate the outputs.
fn reduce_groups(workload: &Workload, groups: BTreeMap<Bytes, Vec<Bytes>>) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for (key, values) in groups {
        let reduced = (workload.reduce_fn)(key, Box::new(values.into_iter()), Bytes::new())?;
        out.extend_from_slice(&reduced);
    }
    Ok(out.freeze())
}

fn named_workload(code: &str) -> Result<Workload> {
    workload::try_named(code).ok_or_else(|| anyhow!("`{code}` is not a known workload"))
}

/// The byte range mapper `index` of `num_mappers` reads. Ranges chunk
/// the object evenly; the last mapper also takes the remainder.
fn byte_range(size: u64, num_mappers: u64, index: u64) -> (u64, u64) {
    let chunk = size / num_mappers;
    let offset = chunk * index;
    let len = if index + 1 == num_mappers {
        size - offset
    } else {
        chunk
    };
    (offset, len)
}

struct Timer {
    started_at: f64,
    read_secs: f64,
    exec_secs: f64,
    write_secs: f64,
}

impl Timer {
    fn start() -> Self {
        Self {
            started_at: unix_now(),
            read_secs: 0.0,
            exec_secs: 0.0,
            write_secs: 0.0,
        }
    }

    fn finish(self) -> TaskTimings {
        TaskTimings {
            started_at: self.started_at,
            finished_at: unix_now(),
            read_secs: self.read_secs,
            exec_secs: self.exec_secs,
            write_secs: self.write_secs,
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use common::minio::ClientConfig;

    use super::*;

    fn context(root: &str) -> ExecutionContext {
        let storage = Client::from_conf(ClientConfig {
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            region: "us-east-1".to_string(),
            url: "http://127.0.0.1:9000".to_string(),
        });
        ExecutionContext::new(storage, minio::path_to_bucket_key(root).unwrap())
    }

    #[test]
    fn test_byte_ranges_cover_the_object() {
        let ranges: Vec<(u64, u64)> = (0..3).map(|index| byte_range(10, 3, index)).collect();
        assert_eq!(ranges, vec![(0, 3), (3, 3), (6, 4)]);
        let total: u64 = ranges.iter().map(|(_, len)| len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_byte_range_of_empty_object_is_empty() {
        assert_eq!(byte_range(0, 4, 0), (0, 0));
        assert_eq!(byte_range(0, 4, 3), (0, 0));
    }

    #[test]
    fn test_small_objects_land_in_the_last_range() {
        assert_eq!(byte_range(2, 4, 0), (0, 0));
        assert_eq!(byte_range(2, 4, 3), (0, 2));
    }

    #[test]
    fn test_task_keys_nest_under_the_root() {
        let bare = context("s3://taskgrid");
        assert_eq!(bare.task_key(7, 42, "map/1-0"), "7/42/map/1-0");

        let prefixed = context("s3://taskgrid/scratch");
        assert_eq!(prefixed.task_key(7, 42, "out"), "scratch/7/42/out");
    }

    #[test]
    fn test_unknown_workloads_are_an_error() {
        assert!(named_workload("no-such-thing").is_err());
        assert!(named_workload("word-count").is_ok());
    }

    #[test]
    fn test_reduce_groups_concatenates_in_key_order() {
        let workload = named_workload("word-count").unwrap();
        let mut groups: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
        groups.insert(Bytes::from("b"), vec![Bytes::from("1")]);
        groups.insert(Bytes::from("a"), vec![Bytes::from("1"), Bytes::from("2")]);

        let out = reduce_groups(&workload, groups).unwrap();
        assert_eq!(out.as_ref(), b"a 3\nb 1\n");
    }
}
