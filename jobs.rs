use crate::artifacts::{local_summary_name, local_thumb_name, ArtifactLayout};
use crate::blobstore::BlobStore;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::models::{IngestStats, UploadJob, UploadReceipt};
use crate::tagging::Tagger;
use crate::thumbnails;
use crate::util::utc_now_iso;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Everything the worker needs to turn an upload into store rows and
/// remote artifacts.
pub struct IngestContext {
    pub store: Store,
    pub blobs: Arc<dyn BlobStore>,
    pub tagger: Arc<dyn Tagger>,
    pub layout: ArtifactLayout,
    pub upload_dir: PathBuf,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
}

/// Single-consumer FIFO of uploads waiting for tagging.
pub struct IngestQueue {
    ctx: Arc<IngestContext>,
    sender: Mutex<Option<Sender<UploadJob>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    cancel: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl IngestQueue {
    pub fn start(ctx: IngestContext) -> Self {
        let ctx = Arc::new(ctx);
        let (tx, rx) = unbounded::<UploadJob>();
        let cancel = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let worker = {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let counters = counters.clone();
            thread::spawn(move || run_worker(rx, ctx, cancel, counters))
        };

        Self {
            ctx,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            cancel,
            counters,
        }
    }

    /// Stores the upload locally and remotely, queues it for tagging and
    /// returns without waiting on the tagger.
    pub fn accept_upload(
        &self,
        source: &Path,
        original_name: &str,
        label: &str,
    ) -> Result<UploadReceipt> {
        let original_name = Path::new(original_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::Path(format!("Invalid upload name: {original_name}")))?;

        let timestamp = utc_now_iso();
        let filename = format!("{}_{}", timestamp.replace(':', "-"), original_name);
        fs::create_dir_all(&self.ctx.upload_dir)?;
        let local_path = self.ctx.upload_dir.join(&filename);
        fs::copy(source, &local_path)?;

        let original_path = self.ctx.layout.original_path(&filename);
        if self.ctx.blobs.exists(&original_path).unwrap_or(false) {
            log::warn!("Overwriting existing blob {original_path}");
        }
        let pushed = fs::read(&local_path)
            .map_err(Error::from)
            .and_then(|bytes| self.ctx.blobs.put(&original_path, &bytes));
        match pushed {
            Ok(_) => log::info!("Uploaded original to {original_path}"),
            Err(err) => log::warn!("Failed to upload original {filename}: {err}"),
        }

        let job = UploadJob {
            id: Uuid::new_v4().to_string(),
            local_path,
            filename: filename.clone(),
            label: label.to_string(),
        };
        let job_id = job.id.clone();
        self.enqueue(job)?;

        Ok(UploadReceipt {
            job_id,
            thumb_path: self.ctx.layout.thumb_path(&filename),
            summary_path: self.ctx.layout.summary_path(&filename),
            original_path,
            filename,
            label: label.to_string(),
            timestamp,
        })
    }

    pub fn enqueue(&self, job: UploadJob) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| Error::Queue("queue lock poisoned".into()))?;
        let Some(tx) = sender.as_ref() else {
            return Err(Error::Queue("queue is closed".into()));
        };
        log::info!("Queued {} as job {}", job.filename, job.id);
        tx.send(job)
            .map_err(|_| Error::Queue("worker has stopped".into()))?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops the worker after its current job. Anything still queued is lost.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.close();
        self.join();
    }

    /// Closes the queue and blocks until every queued job has been handled.
    pub fn drain(&self) -> IngestStats {
        self.close();
        self.join();
        self.stats()
    }

    fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    fn join(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("Ingest worker panicked");
            }
        }
    }
}

impl Drop for IngestQueue {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_worker(
    rx: Receiver<UploadJob>,
    ctx: Arc<IngestContext>,
    cancel: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            if !rx.is_empty() {
                log::warn!("Ingest canceled with {} queued jobs", rx.len());
            }
            break;
        }
        let job = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if cancel.load(Ordering::Relaxed) {
            log::warn!("Dropping job {} for {}", job.id, job.filename);
            break;
        }

        match process_upload(&ctx, &job) {
            Ok(linked) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                log::info!("Tagged {} with {} tags", job.filename, linked);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to process {}: {}", job.filename, err);
            }
        }
    }
}

/// Tags one upload and records it. The summary artifact goes to the bucket
/// before the store is written so every stored image can be rebuilt.
pub fn process_upload(ctx: &IngestContext, job: &UploadJob) -> Result<usize> {
    log::info!("Processing file: {}", job.filename);
    let summary = ctx.tagger.tag_image(&job.local_path)?;
    log::debug!("Tags for {}: {:?}", job.filename, summary.tags());

    fs::create_dir_all(&ctx.upload_dir)?;
    let summary_local = ctx.upload_dir.join(local_summary_name(&job.filename));
    fs::write(&summary_local, &summary.summary)?;
    ctx.blobs
        .put(&ctx.layout.summary_path(&job.filename), summary.summary.as_bytes())?;

    let thumb_local = ctx.upload_dir.join(local_thumb_name(&job.filename));
    let thumb_remote = ctx.layout.thumb_path(&job.filename);
    let thumb = thumbnails::build_thumbnail(&job.local_path, &thumb_local)
        .and_then(|_| Ok(fs::read(&thumb_local)?))
        .and_then(|bytes| ctx.blobs.put(&thumb_remote, &bytes));
    if let Err(err) = thumb {
        log::warn!("Thumbnail failed for {}: {}", job.filename, err);
    }

    ctx.store
        .apply_summary(&job.filename, &job.label, &utc_now_iso(), &summary.summary)
}
