//! Interchangeable ways of running independent per-channel tasks.
//!
//! Every backend returns results in task-submission order, and the first
//! failing task aborts the whole map. Tasks only get read-only access to
//! anything they capture.
//!
//! In-process backends ([`SerialPool`], [`ThreadPool`]) can map any closure.
//! Work that has to leave the process is described by a [`PlaneOp`], which is
//! what the cube pipeline hands to a [`PlanePool`].

mod op;
mod process;

pub use op::{PlaneOp, PreparedOp};
pub use process::{run_worker, ProcessPool, WORKER_EXE};

use std::{num::NonZeroUsize, path::PathBuf, process::ExitStatus};

use indicatif::ProgressBar;
use log::debug;
use ndarray::prelude::*;
use rayon::prelude::*;
use thiserror::Error;

use crate::{convolve::ConvolveError, read::fits::FitsError, regrid::RegridError};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Couldn't build a thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Regrid(#[from] RegridError),

    #[error(transparent)]
    Convolve(#[from] ConvolveError),

    #[error("Couldn't start the worker {}: {source}", .exe.display())]
    Spawn {
        exe: PathBuf,
        source: std::io::Error,
    },

    #[error("Worker {chunk} exited with {status}: {output}")]
    Worker {
        chunk: usize,
        status: ExitStatus,
        output: String,
    },

    #[error("{} holds planes of shape {got:?}; expected {expected:?}", .file.display())]
    ChunkShape {
        file: PathBuf,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Couldn't write a worker's job description: {0}")]
    WriteJob(#[from] toml::ser::Error),

    #[error("Couldn't read a worker's job description: {0}")]
    ReadJob(#[from] toml::de::Error),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// The strategy for running tasks within this process.
pub trait WorkerPool: Sync {
    /// Apply `f` to every task, returning the results in the order of `tasks`.
    /// If any task fails, one of the errors is returned.
    fn map<T, R, E, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>, E>
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T) -> Result<R, E> + Sync + Send;
}

/// The strategy for processing every channel plane of a cube.
pub trait PlanePool: Sync {
    /// Apply `op` to every plane of `cube` (indexed \[channel\]\[y\]\[x\]),
    /// keeping the channel order. `progress` advances as planes finish.
    fn map_planes(
        &self,
        op: &PlaneOp,
        cube: ArrayView3<f32>,
        progress: &ProgressBar,
    ) -> Result<Array3<f32>, PoolError>;
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Serial,
    /// A shared-memory thread pool with this many threads.
    Threads(NonZeroUsize),
    /// This many worker processes.
    Processes(NonZeroUsize),
}

/// Run everything on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPool;

impl WorkerPool for SerialPool {
    fn map<T, R, E, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>, E>
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T) -> Result<R, E> + Sync + Send,
    {
        tasks.into_iter().map(f).collect()
    }
}

impl PlanePool for SerialPool {
    fn map_planes(
        &self,
        op: &PlaneOp,
        cube: ArrayView3<f32>,
        progress: &ProgressBar,
    ) -> Result<Array3<f32>, PoolError> {
        map_planes_in_process(self, op, cube, progress)
    }
}

/// A rayon thread pool.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool {
    pub fn new(num_threads: NonZeroUsize) -> Result<ThreadPool, PoolError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.get())
            .build()?;
        Ok(ThreadPool { pool })
    }
}

impl WorkerPool for ThreadPool {
    fn map<T, R, E, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>, E>
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T) -> Result<R, E> + Sync + Send,
    {
        self.pool.install(|| tasks.into_par_iter().map(f).collect())
    }
}

impl PlanePool for ThreadPool {
    fn map_planes(
        &self,
        op: &PlaneOp,
        cube: ArrayView3<f32>,
        progress: &ProgressBar,
    ) -> Result<Array3<f32>, PoolError> {
        map_planes_in_process(self, op, cube, progress)
    }
}

/// Prepare `op` once, then hand the planes to `pool`.
fn map_planes_in_process<P: WorkerPool>(
    pool: &P,
    op: &PlaneOp,
    cube: ArrayView3<f32>,
    progress: &ProgressBar,
) -> Result<Array3<f32>, PoolError> {
    let prepared = op.prepare()?;
    let planes = pool.map(cube.outer_iter().collect(), |plane: ArrayView2<f32>| {
        let out = prepared.apply(plane);
        progress.inc(1);
        out
    })?;
    Ok(stack_planes(op.out_dim(), planes))
}

/// Stack planes of shape `dim` along a new leading axis.
pub(crate) fn stack_planes(dim: (usize, usize), planes: Vec<Array2<f32>>) -> Array3<f32> {
    let mut out = Array3::zeros((planes.len(), dim.0, dim.1));
    for (mut dst, src) in out.outer_iter_mut().zip(planes) {
        dst.assign(&src);
    }
    out
}

/// The configured backend.
pub enum Pool {
    Serial(SerialPool),
    Threads(ThreadPool),
    Processes(ProcessPool),
}

impl Pool {
    pub fn new(kind: PoolKind) -> Result<Pool, PoolError> {
        debug!("Using worker pool {kind:?}");
        Ok(match kind {
            PoolKind::Serial => Pool::Serial(SerialPool),
            PoolKind::Threads(n) => Pool::Threads(ThreadPool::new(n)?),
            PoolKind::Processes(n) => Pool::Processes(ProcessPool::new(n)?),
        })
    }
}

impl PlanePool for Pool {
    fn map_planes(
        &self,
        op: &PlaneOp,
        cube: ArrayView3<f32>,
        progress: &ProgressBar,
    ) -> Result<Array3<f32>, PoolError> {
        match self {
            Pool::Serial(p) => p.map_planes(op, cube, progress),
            Pool::Threads(p) => p.map_planes(op, cube, progress),
            Pool::Processes(p) => p.map_planes(op, cube, progress),
        }
    }
}
