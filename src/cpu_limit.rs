//! Tools for limiting the number of concurrent CPU-bound tasks.
//!
//! Native text extraction and OCR get separate pools. `pdftotext` is cheap,
//! but `pdftocairo` plus `tesseract` will happily use a whole core and a
//! rasterized page's worth of memory each, so we keep that pool small.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Default size of the OCR pool.
pub const DEFAULT_OCR_JOBS: usize = 2;

/// Separately bounded pools for native extraction and OCR.
///
/// Cloning shares the underlying permits.
#[derive(Clone, Debug)]
pub struct WorkerPools {
    native: Arc<Semaphore>,
    ocr: Arc<Semaphore>,
}

impl WorkerPools {
    /// Create pools with the given sizes. Zero is treated as one.
    pub fn new(native_jobs: usize, ocr_jobs: usize) -> Self {
        Self {
            native: Arc::new(Semaphore::new(native_jobs.max(1))),
            ocr: Arc::new(Semaphore::new(ocr_jobs.max(1))),
        }
    }

    /// Call an async function while holding a native extraction permit.
    #[instrument(level = "trace", skip_all)]
    pub async fn with_native_permit<Func, Fut, R>(&self, f: Func) -> Result<R>
    where
        Func: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _permit = self
            .native
            .acquire()
            .await
            .context("Could not acquire native extraction permit")?;
        Ok(f().await)
    }

    /// Call an async function while holding an OCR permit.
    #[instrument(level = "trace", skip_all)]
    pub async fn with_ocr_permit<Func, Fut, R>(&self, f: Func) -> Result<R>
    where
        Func: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _permit = self
            .ocr
            .acquire()
            .await
            .context("Could not acquire OCR permit")?;
        Ok(f().await)
    }
}

impl Default for WorkerPools {
    /// One native extraction per CPU, and a small OCR pool.
    fn default() -> Self {
        Self::new(num_cpus::get(), DEFAULT_OCR_JOBS)
    }
}
