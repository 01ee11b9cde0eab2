//! Memory Backend Tests
//!
//! Tests verify:
//! - Completions are delivered through the bound worker only
//! - Store initialization preconditions (environment, device, single store)
//! - Blob create/open/resize/sync/read/write/close/delete semantics
//! - Fault injection (stalled and failing operations)
//! - Metadata page persistence on unload

use std::sync::Arc;

use blobvfs::backend::{
    BackendOp, BlobBackend, BlobHandle, Callback, DmaBuf, EngineResult, EnvOptions, Errno,
    IoChannel, MemoryBackend, MetadataPage, DMA_ALIGN,
};
use blobvfs::bridge::{Bridge, Completion, Worker};
use blobvfs::topology::{Topology, DEFAULT_DEVICE};
use tracing::level_filters::LevelFilter;

const CLUSTER: u64 = 64 * 1024;
const UNIT: usize = 512;

// =============================================================================
// Helper Functions
// =============================================================================

/// Drive one callback operation to completion and hand back its engine result
fn run<T, F>(worker: &Arc<Worker>, start: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce(Callback<T>) + Send + 'static,
{
    let completion = Completion::new();
    let done = completion.clone();
    Bridge::new(1_000)
        .drive(
            worker,
            "test op",
            move || {
                start(Box::new(move |result| {
                    done.complete(Ok(result));
                }))
            },
            &completion,
        )
        .unwrap()
}

/// Drive one read/write to completion; returns the buffer and the status
fn run_io<F>(worker: &Arc<Worker>, start: F) -> (DmaBuf, EngineResult<()>)
where
    F: FnOnce(Box<dyn FnOnce(DmaBuf, EngineResult<()>) + Send>) + Send + 'static,
{
    let completion = Completion::new();
    let done = completion.clone();
    Bridge::new(1_000)
        .drive(
            worker,
            "test io",
            move || {
                start(Box::new(move |buf, status| {
                    done.complete(Ok((buf, status)));
                }))
            },
            &completion,
        )
        .unwrap()
}

fn env() -> EnvOptions {
    EnvOptions {
        name: "memory-tests".to_string(),
        log_level: LevelFilter::DEBUG,
    }
}

/// Backend with environment, topology and store up
fn setup() -> (Arc<MemoryBackend>, Arc<Worker>) {
    let backend = Arc::new(MemoryBackend::builder().cluster_size(CLUSTER).build());
    backend.init_env(&env()).unwrap();

    let worker = Worker::new("memory-tests");
    backend.bind_worker(Arc::clone(&worker));

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.load_topology(Topology::default(), cb)).unwrap();
    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.init_store(DEFAULT_DEVICE, cb)).unwrap();

    (backend, worker)
}

/// Create and open a blob resized to `clusters`
fn open_blob(backend: &Arc<MemoryBackend>, worker: &Arc<Worker>, clusters: u64) -> BlobHandle {
    let b = Arc::clone(backend);
    let id = run(worker, move |cb| b.create_blob(cb)).unwrap();
    let b = Arc::clone(backend);
    let blob = run(worker, move |cb| b.open_blob(id, cb)).unwrap();
    let b = Arc::clone(backend);
    run(worker, move |cb| b.resize_blob(blob, clusters, cb)).unwrap();
    blob
}

fn write_unit(
    backend: &Arc<MemoryBackend>,
    worker: &Arc<Worker>,
    blob: BlobHandle,
    channel: IoChannel,
    offset: u64,
    fill: u8,
) -> EngineResult<()> {
    let mut buf = backend.dma().try_alloc(UNIT, DMA_ALIGN).unwrap();
    buf.fill(fill);
    let b = Arc::clone(backend);
    run_io(worker, move |cb| b.write_blob(blob, channel, buf, offset, 1, cb)).1
}

fn read_unit(
    backend: &Arc<MemoryBackend>,
    worker: &Arc<Worker>,
    blob: BlobHandle,
    channel: IoChannel,
    offset: u64,
) -> (DmaBuf, EngineResult<()>) {
    let buf = backend.dma().try_alloc(UNIT, DMA_ALIGN).unwrap();
    let b = Arc::clone(backend);
    run_io(worker, move |cb| b.read_blob(blob, channel, buf, offset, 1, cb))
}

// =============================================================================
// Delivery Tests
// =============================================================================

#[test]
fn test_completion_waits_for_poll() {
    let (backend, worker) = setup();

    backend.create_blob(Box::new(|_| {}));

    assert_eq!(worker.pending(), 1);
    assert_eq!(worker.poll(), 1);
    assert_eq!(backend.blob_count(), 1);
}

#[test]
fn test_stalled_operation_never_completes() {
    let (backend, worker) = setup();
    backend.stall(BackendOp::CreateBlob);

    backend.create_blob(Box::new(|_| panic!("stalled completion delivered")));
    assert_eq!(worker.pending(), 0);

    backend.clear_faults();
    let b = Arc::clone(&backend);
    assert!(run(&worker, move |cb| b.create_blob(cb)).is_ok());
}

#[test]
fn test_injected_failure_is_reported() {
    let (backend, worker) = setup();
    backend.fail(BackendOp::CreateBlob, Errno::NOMEM);

    let b = Arc::clone(&backend);
    assert_eq!(run(&worker, move |cb| b.create_blob(cb)), Err(Errno::NOMEM));
    assert_eq!(backend.blob_count(), 0);
}

// =============================================================================
// Store Tests
// =============================================================================

#[test]
fn test_store_geometry() {
    let (backend, _worker) = setup();

    assert!(backend.has_store());
    assert_eq!(backend.stores_initialized(), 1);
    // 16 MiB device, 64 KiB clusters, first cluster holds metadata
    assert_eq!(backend.free_cluster_count(), 255);
    assert_eq!(backend.log_level(), LevelFilter::DEBUG);
}

#[test]
fn test_init_store_reports_geometry() {
    let backend = Arc::new(MemoryBackend::builder().cluster_size(CLUSTER).build());
    backend.init_env(&env()).unwrap();
    let worker = Worker::new("w");
    backend.bind_worker(Arc::clone(&worker));

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.load_topology(Topology::default(), cb)).unwrap();
    let b = Arc::clone(&backend);
    let info = run(&worker, move |cb| b.init_store(DEFAULT_DEVICE, cb)).unwrap();

    assert_eq!(info.io_unit_size, UNIT);
    assert_eq!(info.cluster_size, CLUSTER);
    assert_eq!(info.total_clusters, 256);
    assert_eq!(info.units_per_cluster(), 128);
}

#[test]
fn test_init_store_requires_environment() {
    let backend = Arc::new(MemoryBackend::new());
    let worker = Worker::new("w");
    backend.bind_worker(Arc::clone(&worker));

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.load_topology(Topology::default(), cb)).unwrap();
    let b = Arc::clone(&backend);
    let result = run(&worker, move |cb| b.init_store(DEFAULT_DEVICE, cb));

    assert_eq!(result, Err(Errno::INVAL));
}

#[test]
fn test_init_store_on_unknown_device() {
    let backend = Arc::new(MemoryBackend::new());
    backend.init_env(&env()).unwrap();
    let worker = Worker::new("w");
    backend.bind_worker(Arc::clone(&worker));

    let b = Arc::clone(&backend);
    let result = run(&worker, move |cb| b.init_store("Nvme0n1", cb));

    assert_eq!(result, Err(Errno::NODEV));
}

#[test]
fn test_second_store_is_busy() {
    let (backend, worker) = setup();

    let b = Arc::clone(&backend);
    let result = run(&worker, move |cb| b.init_store(DEFAULT_DEVICE, cb));

    assert_eq!(result, Err(Errno::BUSY));
}

#[test]
fn test_reloading_identical_topology_keeps_devices() {
    let (backend, worker) = setup();

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.load_topology(Topology::default(), cb)).unwrap();

    assert_eq!(backend.devices().len(), 1);
    assert!(backend.has_store());
}

#[test]
fn test_invalid_topology_is_rejected() {
    let (backend, worker) = setup();
    let bad = Topology::single_malloc("Bad0", 16, 100);

    let b = Arc::clone(&backend);
    let result = run(&worker, move |cb| b.load_topology(bad, cb));

    assert_eq!(result, Err(Errno::INVAL));
}

#[test]
fn test_unallocatable_device_is_out_of_memory() {
    let (backend, worker) = setup();
    let huge = Topology::single_malloc("Huge0", 1 << 50, 512);

    let b = Arc::clone(&backend);
    let result = run(&worker, move |cb| b.load_topology(huge, cb));

    assert_eq!(result, Err(Errno::NOMEM));
    assert_eq!(backend.devices().len(), 1);
}

#[test]
fn test_failed_unload_still_releases_store() {
    let (backend, worker) = setup();
    backend.fail(BackendOp::Unload, Errno::IO);

    let b = Arc::clone(&backend);
    assert_eq!(run(&worker, move |cb| b.unload_store(cb)), Err(Errno::IO));
    assert!(!backend.has_store());

    backend.clear_faults();
    let b = Arc::clone(&backend);
    assert!(run(&worker, move |cb| b.init_store(DEFAULT_DEVICE, cb)).is_ok());
}

#[test]
fn test_channels_are_tracked() {
    let (backend, _worker) = setup();

    let a = backend.alloc_io_channel().unwrap();
    let b = backend.alloc_io_channel().unwrap();
    assert_ne!(a, b);
    assert_eq!(backend.open_channels(), 2);

    backend.free_io_channel(a);
    backend.free_io_channel(b);
    assert_eq!(backend.open_channels(), 0);
}

#[test]
fn test_channel_fault_yields_none() {
    let (backend, _worker) = setup();
    backend.fail(BackendOp::AllocChannel, Errno::NOMEM);

    assert!(backend.alloc_io_channel().is_none());
}

// =============================================================================
// Blob Tests
// =============================================================================

#[test]
fn test_resize_takes_free_clusters() {
    let (backend, worker) = setup();

    open_blob(&backend, &worker, 5);

    assert_eq!(backend.free_cluster_count(), 250);
}

#[test]
fn test_resize_beyond_free_space() {
    let (backend, worker) = setup();
    let b = Arc::clone(&backend);
    let id = run(&worker, move |cb| b.create_blob(cb)).unwrap();
    let b = Arc::clone(&backend);
    let blob = run(&worker, move |cb| b.open_blob(id, cb)).unwrap();

    let b = Arc::clone(&backend);
    let result = run(&worker, move |cb| b.resize_blob(blob, 256, cb));

    assert_eq!(result, Err(Errno::NOSPC));
    assert_eq!(backend.free_cluster_count(), 255);
}

#[test]
fn test_write_then_read_unit() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 1);
    let channel = backend.alloc_io_channel().unwrap();

    write_unit(&backend, &worker, blob, channel, 0, 0xAB).unwrap();
    let (buf, status) = read_unit(&backend, &worker, blob, channel, 0);

    status.unwrap();
    assert!(buf.iter().all(|&b| b == 0xAB));
}

#[test]
fn test_units_are_independent() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 2);
    let channel = backend.alloc_io_channel().unwrap();

    write_unit(&backend, &worker, blob, channel, 0, 1).unwrap();
    write_unit(&backend, &worker, blob, channel, 130, 2).unwrap();

    assert!(read_unit(&backend, &worker, blob, channel, 0).0.iter().all(|&b| b == 1));
    assert!(read_unit(&backend, &worker, blob, channel, 130).0.iter().all(|&b| b == 2));
    assert!(read_unit(&backend, &worker, blob, channel, 1).0.iter().all(|&b| b == 0));
}

#[test]
fn test_io_beyond_allocated_clusters() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 1);
    let channel = backend.alloc_io_channel().unwrap();

    assert_eq!(write_unit(&backend, &worker, blob, channel, 128, 0), Err(Errno::INVAL));
}

#[test]
fn test_io_on_empty_blob() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 0);
    let channel = backend.alloc_io_channel().unwrap();

    assert_eq!(write_unit(&backend, &worker, blob, channel, 0, 0), Err(Errno::INVAL));
}

#[test]
fn test_io_with_freed_channel() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 1);
    let channel = backend.alloc_io_channel().unwrap();
    backend.free_io_channel(channel);

    let (buf, status) = read_unit(&backend, &worker, blob, channel, 0);

    assert_eq!(status, Err(Errno::BADF));
    assert_eq!(buf.len(), UNIT);
}

#[test]
fn test_failed_io_returns_buffer() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 1);
    let channel = backend.alloc_io_channel().unwrap();
    backend.fail(BackendOp::Read, Errno::IO);

    let (buf, status) = read_unit(&backend, &worker, blob, channel, 0);

    assert_eq!(status, Err(Errno::IO));
    assert_eq!(backend.dma().in_use(), UNIT);
    drop(buf);
    assert_eq!(backend.dma().in_use(), 0);
}

#[test]
fn test_io_on_closed_blob() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 1);
    let channel = backend.alloc_io_channel().unwrap();

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.close_blob(blob, cb)).unwrap();

    assert_eq!(write_unit(&backend, &worker, blob, channel, 0, 0), Err(Errno::BADF));
}

#[test]
fn test_delete_requires_close() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 3);

    let b = Arc::clone(&backend);
    assert_eq!(run(&worker, move |cb| b.delete_blob(blob.id(), cb)), Err(Errno::BUSY));

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.close_blob(blob, cb)).unwrap();
    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.delete_blob(blob.id(), cb)).unwrap();

    assert_eq!(backend.blob_count(), 0);
    assert_eq!(backend.free_cluster_count(), 255);
}

#[test]
fn test_reused_cluster_reads_zero() {
    let (backend, worker) = setup();
    let channel = backend.alloc_io_channel().unwrap();

    let first = open_blob(&backend, &worker, 1);
    write_unit(&backend, &worker, first, channel, 0, 0xFF).unwrap();
    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.close_blob(first, cb)).unwrap();
    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.delete_blob(first.id(), cb)).unwrap();

    let second = open_blob(&backend, &worker, 1);
    let (buf, status) = read_unit(&backend, &worker, second, channel, 0);

    status.unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_open_unknown_blob() {
    let (backend, worker) = setup();

    let b = Arc::clone(&backend);
    assert_eq!(run(&worker, move |cb| b.open_blob(999, cb)), Err(Errno::NOENT));
}

// =============================================================================
// Metadata Tests
// =============================================================================

#[test]
fn test_sync_persists_blob_table() {
    let (backend, worker) = setup();
    let blob = open_blob(&backend, &worker, 2);

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.sync_blob_metadata(blob, cb)).unwrap();

    let page = backend.read_metadata(DEFAULT_DEVICE).unwrap().unwrap();
    assert_eq!(page.cluster_size, CLUSTER);
    assert_eq!(page.blobs.len(), 1);
    assert_eq!(page.blobs[0].id, blob.id());
    assert_eq!(page.blobs[0].clusters, vec![1, 2]);
}

#[test]
fn test_unload_persists_and_drops_store() {
    let (backend, worker) = setup();
    open_blob(&backend, &worker, 1);

    let b = Arc::clone(&backend);
    run(&worker, move |cb| b.unload_store(cb)).unwrap();

    assert!(!backend.has_store());
    let page = backend.read_metadata(DEFAULT_DEVICE).unwrap().unwrap();
    assert_eq!(page.blobs.len(), 1);

    let b = Arc::clone(&backend);
    assert_eq!(run(&worker, move |cb| b.create_blob(cb)), Err(Errno::NODEV));
}

#[test]
fn test_metadata_of_unknown_device() {
    let (backend, _worker) = setup();

    assert!(backend.read_metadata("Malloc9").unwrap().is_none());
}

#[test]
fn test_metadata_page_rejects_corruption() {
    let page = MetadataPage {
        cluster_size: CLUSTER,
        blobs: Vec::new(),
    };
    let mut bytes = page.encode().unwrap();
    assert_eq!(MetadataPage::decode(&bytes).unwrap(), Some(page));

    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    assert!(MetadataPage::decode(&bytes).is_err());

    assert_eq!(MetadataPage::decode(&[0u8; 64]).unwrap(), None);
}
