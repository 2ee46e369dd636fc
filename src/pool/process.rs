//! Worker processes.
//!
//! The planes are split into one contiguous chunk per worker. Each chunk is
//! written to a FITS file in a temporary directory along with a TOML job
//! description, and a worker process (the `quocka_worker` executable) is
//! started on it. Workers write their planes to another FITS file, which is
//! read back once every worker has finished.

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    thread::scope,
};

use crossbeam_channel::unbounded;
use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use indicatif::ProgressBar;
use log::{debug, trace};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use super::{stack_planes, PlaneOp, PlanePool, PoolError};
use crate::read::fits::{
    fits_get_image, fits_get_image_size, fits_open, fits_open_hdu, FitsError,
};

/// The name of the worker executable.
pub const WORKER_EXE: &str = "quocka_worker";

/// What one worker is asked to do.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerJob {
    input: PathBuf,
    output: PathBuf,
    op: PlaneOp,
}

/// Runs chunks of planes in separate worker processes.
#[derive(Debug, Clone)]
pub struct ProcessPool {
    exe: PathBuf,
    num_workers: NonZeroUsize,
}

impl ProcessPool {
    /// Use the worker executable that sits next to the running executable.
    pub fn new(num_workers: NonZeroUsize) -> Result<ProcessPool, PoolError> {
        let exe = std::env::current_exe()?
            .with_file_name(format!("{WORKER_EXE}{}", std::env::consts::EXE_SUFFIX));
        Ok(ProcessPool::with_executable(exe, num_workers))
    }

    pub fn with_executable(exe: PathBuf, num_workers: NonZeroUsize) -> ProcessPool {
        ProcessPool { exe, num_workers }
    }
}

impl PlanePool for ProcessPool {
    fn map_planes(
        &self,
        op: &PlaneOp,
        cube: ArrayView3<f32>,
        progress: &ProgressBar,
    ) -> Result<Array3<f32>, PoolError> {
        let num_planes = cube.len_of(Axis(0));
        let (out_ny, out_nx) = op.out_dim();
        if num_planes == 0 {
            return Ok(Array3::zeros((0, out_ny, out_nx)));
        }

        let dir = tempfile::Builder::new().prefix("quocka_planes").tempdir()?;
        let chunk_size = (num_planes + self.num_workers.get() - 1) / self.num_workers.get();
        let mut jobs = vec![];
        for (i, chunk) in cube.axis_chunks_iter(Axis(0), chunk_size).enumerate() {
            let job = WorkerJob {
                input: dir.path().join(format!("chunk{i}.in.fits")),
                output: dir.path().join(format!("chunk{i}.out.fits")),
                op: op.clone(),
            };
            write_planes(&job.input, chunk)?;
            let job_file = dir.path().join(format!("chunk{i}.toml"));
            std::fs::write(&job_file, toml::to_string(&job)?)?;
            jobs.push((job_file, job, chunk.len_of(Axis(0))));
        }
        debug!(
            "Running {} {WORKER_EXE} processes on {num_planes} planes",
            jobs.len()
        );

        let (result_tx, result_rx) = unbounded();
        let first_error = scope(|s| {
            for (i, (job_file, _, _)) in jobs.iter().enumerate() {
                let result_tx = result_tx.clone();
                let exe = &self.exe;
                s.spawn(move || {
                    trace!("Starting worker {i} on {}", job_file.display());
                    let output = Command::new(exe)
                        .arg(job_file)
                        .stdin(Stdio::null())
                        .output();
                    // The receiver lives until every worker has reported.
                    let _ = result_tx.send((i, output));
                });
            }
            // Only the spawned threads hold senders now.
            drop(result_tx);

            let mut first_error = None;
            for (i, output) in result_rx.iter() {
                let failure = match output {
                    Err(source) => Some(PoolError::Spawn {
                        exe: self.exe.clone(),
                        source,
                    }),
                    Ok(o) if !o.status.success() => Some(PoolError::Worker {
                        chunk: i,
                        status: o.status,
                        output: worker_output(&o),
                    }),
                    Ok(_) => {
                        progress.inc(jobs[i].2 as u64);
                        None
                    }
                };
                if first_error.is_none() {
                    first_error = failure;
                }
            }
            first_error
        });
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut out = Array3::zeros((num_planes, out_ny, out_nx));
        for ((_, job, len), mut dst) in jobs
            .iter()
            .zip(out.axis_chunks_iter_mut(Axis(0), chunk_size))
        {
            let planes = read_planes(&job.output)?;
            if planes.dim() != (*len, out_ny, out_nx) {
                return Err(PoolError::ChunkShape {
                    file: job.output.clone(),
                    expected: vec![*len, out_ny, out_nx],
                    got: planes.shape().to_vec(),
                });
            }
            dst.assign(&planes);
        }
        Ok(out)
    }
}

/// Whatever a worker printed, for error messages.
fn worker_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{} {}", stdout.trim(), stderr.trim())
        .trim()
        .to_string()
}

/// Do the job described in `job_file`; this is what a worker process runs.
/// Returns the number of planes processed.
pub fn run_worker(job_file: &Path) -> Result<usize, PoolError> {
    let job: WorkerJob = toml::from_str(&std::fs::read_to_string(job_file)?)?;
    trace!("Job: {job:?}");
    let prepared = job.op.prepare()?;
    let input = read_planes(&job.input)?;
    let planes = input
        .outer_iter()
        .map(|plane| prepared.apply(plane))
        .collect::<Result<Vec<_>, _>>()?;
    let out = stack_planes(job.op.out_dim(), planes);
    write_planes(&job.output, out.view())?;
    Ok(out.len_of(Axis(0)))
}

/// Write planes as the primary image of a new FITS file.
fn write_planes(file: &Path, planes: ArrayView3<f32>) -> Result<(), PoolError> {
    let (n, ny, nx) = planes.dim();
    let image_description = ImageDescription {
        data_type: ImageType::Float,
        dimensions: &[n, ny, nx],
    };
    let mut fptr = FitsFile::create(file)
        .with_custom_primary(&image_description)
        .open()
        .map_err(FitsError::from)?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    let planes = planes.as_standard_layout();
    hdu.write_image(
        &mut fptr,
        planes.as_slice().expect("standard layout is contiguous"),
    )
    .map_err(FitsError::from)?;
    Ok(())
}

fn read_planes(file: &Path) -> Result<Array3<f32>, PoolError> {
    let mut fptr = fits_open(file)?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    let shape = fits_get_image_size(&hdu)?.clone();
    let bad_shape = || PoolError::ChunkShape {
        file: file.to_path_buf(),
        expected: vec![],
        got: shape.clone(),
    };
    let dim = match shape.as_slice() {
        &[n, ny, nx] => (n, ny, nx),
        _ => return Err(bad_shape()),
    };
    let flat: Vec<f32> = fits_get_image(&mut fptr, &hdu)?;
    Array3::from_shape_vec(dim, flat).map_err(|_| bad_shape())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::beam::Beam;

    fn smooth(dim: (usize, usize)) -> PlaneOp {
        PlaneOp::Smooth {
            conv: Beam::point(),
            pixel_scale: 1.0,
            dim,
            factor: 0.5,
        }
    }

    #[test]
    fn a_worker_job_by_hand() {
        let tmp = tempdir().unwrap();
        let cube = Array3::from_shape_fn((3, 4, 5), |(c, y, x)| (c * 20 + y * 5 + x) as f32);
        let job = WorkerJob {
            input: tmp.path().join("in.fits"),
            output: tmp.path().join("out.fits"),
            op: smooth((4, 5)),
        };
        write_planes(&job.input, cube.view()).unwrap();
        let job_file = tmp.path().join("job.toml");
        std::fs::write(&job_file, toml::to_string(&job).unwrap()).unwrap();

        assert_eq!(run_worker(&job_file).unwrap(), 3);
        assert_eq!(read_planes(&job.output).unwrap(), cube.mapv(|v| v * 0.5));
    }

    #[test]
    fn a_missing_worker_can_not_be_started() {
        let pool = ProcessPool::with_executable(
            PathBuf::from("/definitely/not/a/worker"),
            NonZeroUsize::new(2).unwrap(),
        );
        let cube = Array3::zeros((4, 3, 3));
        assert!(matches!(
            pool.map_planes(&smooth((3, 3)), cube.view(), &ProgressBar::hidden()),
            Err(PoolError::Spawn { .. })
        ));
    }

    #[test]
    fn the_worker_lives_next_to_the_executable() {
        let pool = ProcessPool::new(NonZeroUsize::new(1).unwrap()).unwrap();
        let name = pool.exe.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(WORKER_EXE), "{name}");
        assert_eq!(pool.exe.parent(), std::env::current_exe().unwrap().parent());
    }
}
