//! HDF5 storage for logged spectra.
//!
//! Every acquisition gets its own file
//! `<YYYYmmdd_HHMMSS>-<id>-spectro_acq_data.h5` with one group `acq<id>`
//! holding:
//!
//! * `fftdata` `(capacity, spectrum_len)` f64
//! * `num_averages` `(capacity,)` u32
//! * `msrmt_num` `(capacity,)` u64
//!
//! The group attribute `count` holds the number of valid rows and the file
//! attribute `n_acq` the acquisition id.

use crate::datalog::{AcquisitionLayout, SpectrumSink};
use crate::measurement::Measurement;
use anyhow::{anyhow, ensure, Result};
use hdf5::{Attribute, Dataset, File};
use log::debug;
use ndarray::{s, Array1, Array2};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Rows buffered in memory before they are written.
const BUFFER_ROWS: usize = 16;

/// Writes each acquisition into a new HDF5 file under `output_dir`.
pub struct HDF5Writer {
    output_dir: PathBuf,
    current: Option<AcquisitionFile>,
}

impl HDF5Writer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            current: None,
        })
    }

    /// Path of the file for the open acquisition.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    fn file_name(id: u32) -> String {
        let now = OffsetDateTime::now_utc();
        format!(
            "{:04}{:02}{:02}_{:02}{:02}{:02}-{:04}-spectro_acq_data.h5",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            id
        )
    }
}

impl SpectrumSink for HDF5Writer {
    fn open_acquisition(&mut self, layout: AcquisitionLayout) -> Result<()> {
        if self.current.is_some() {
            self.close_acquisition()?;
        }
        let path = self.output_dir.join(Self::file_name(layout.id));
        self.current = Some(AcquisitionFile::create(path, layout)?);
        Ok(())
    }

    fn append(&mut self, row: usize, measurement: &Measurement) -> Result<()> {
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| anyhow!("No acquisition file open"))?;
        ensure!(
            row == current.rows_written + current.buffer_count,
            "Row {} out of order",
            row
        );
        current.append(measurement)
    }

    fn close_acquisition(&mut self) -> Result<()> {
        let mut current = self
            .current
            .take()
            .ok_or_else(|| anyhow!("No acquisition file open"))?;
        current.flush()?;
        current.file.flush()?;
        debug!(
            "Closed {} with {} rows",
            current.path.display(),
            current.rows_written
        );
        Ok(())
    }
}

/// Datasets and row buffers for one acquisition.
struct AcquisitionFile {
    path: PathBuf,
    file: File,
    capacity: usize,
    spectrum_len: usize,
    fftdata: Dataset,
    num_averages: Dataset,
    msrmt_num: Dataset,
    count: Attribute,
    rows_written: usize,
    buffer_count: usize,
    fft_buffer: Array2<f64>,
    avg_buffer: Array1<u32>,
    num_buffer: Array1<u64>,
}

impl AcquisitionFile {
    fn create(path: PathBuf, layout: AcquisitionLayout) -> Result<Self> {
        ensure!(layout.capacity > 0, "Acquisition capacity must be positive");
        ensure!(layout.spectrum_len > 0, "Spectrum length must be positive");

        let file = File::create(&path)?;
        let group = file.create_group(&format!("acq{:08}", layout.id))?;
        let chunk_rows = BUFFER_ROWS.min(layout.capacity);

        let fftdata = group
            .new_dataset::<f64>()
            .shape((layout.capacity, layout.spectrum_len))
            .chunk((chunk_rows, layout.spectrum_len))
            .create("fftdata")?;
        let num_averages = group
            .new_dataset::<u32>()
            .shape(layout.capacity)
            .create("num_averages")?;
        let msrmt_num = group
            .new_dataset::<u64>()
            .shape(layout.capacity)
            .create("msrmt_num")?;

        let count = group.new_attr::<u64>().create("count")?;
        count.write_scalar(&0u64)?;
        file.new_attr::<u32>()
            .create("n_acq")?
            .write_scalar(&layout.id)?;

        debug!("Prepared new group {} in {}", layout.id, path.display());
        Ok(Self {
            path,
            file,
            capacity: layout.capacity,
            spectrum_len: layout.spectrum_len,
            fftdata,
            num_averages,
            msrmt_num,
            count,
            rows_written: 0,
            buffer_count: 0,
            fft_buffer: Array2::zeros((chunk_rows, layout.spectrum_len)),
            avg_buffer: Array1::zeros(chunk_rows),
            num_buffer: Array1::zeros(chunk_rows),
        })
    }

    fn append(&mut self, measurement: &Measurement) -> Result<()> {
        ensure!(
            measurement.spectrum.len() == self.spectrum_len,
            "Spectrum length {} does not match dataset length {}",
            measurement.spectrum.len(),
            self.spectrum_len
        );
        ensure!(
            self.rows_written + self.buffer_count < self.capacity,
            "Maximum number of measurements reached"
        );

        self.fft_buffer
            .slice_mut(s![self.buffer_count, ..])
            .assign(&measurement.spectrum);
        self.avg_buffer[self.buffer_count] = measurement.num_averages;
        self.num_buffer[self.buffer_count] = measurement.stats.total;
        self.buffer_count += 1;

        if self.buffer_count == self.fft_buffer.nrows() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer_count == 0 {
            return Ok(());
        }
        let rows = self.rows_written..self.rows_written + self.buffer_count;

        let fft = self.fft_buffer.slice(s![0..self.buffer_count, ..]).to_owned();
        self.fftdata.write_slice(&fft, (rows.clone(), ..))?;
        let avg = self.avg_buffer.slice(s![0..self.buffer_count]).to_owned();
        self.num_averages.write_slice(&avg, rows.clone())?;
        let num = self.num_buffer.slice(s![0..self.buffer_count]).to_owned();
        self.msrmt_num.write_slice(&num, rows)?;

        self.rows_written += self.buffer_count;
        self.buffer_count = 0;
        self.count.write_scalar(&(self.rows_written as u64))?;
        Ok(())
    }
}

/// One acquisition read back from a log file, trimmed to its valid rows.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedAcquisition {
    pub name: String,
    pub fftdata: Array2<f64>,
    pub num_averages: Array1<u32>,
    pub msrmt_num: Array1<u64>,
}

/// Reads every acquisition group of a log file.
pub fn read_acquisitions(path: &Path) -> Result<Vec<LoggedAcquisition>> {
    let file = File::open(path)?;
    let mut names = file.member_names()?;
    names.retain(|n| n.starts_with("acq"));
    names.sort();

    let mut acquisitions = Vec::with_capacity(names.len());
    for name in names {
        let group = file.group(&name)?;
        let count = group.attr("count")?.read_scalar::<u64>()? as usize;
        let fftdata = group
            .dataset("fftdata")?
            .read_slice_2d::<f64, _>((0..count, ..))?;
        let num_averages = group
            .dataset("num_averages")?
            .read_slice_1d::<u32, _>(0..count)?;
        let msrmt_num = group
            .dataset("msrmt_num")?
            .read_slice_1d::<u64, _>(0..count)?;
        acquisitions.push(LoggedAcquisition {
            name,
            fftdata,
            num_averages,
            msrmt_num,
        });
    }
    Ok(acquisitions)
}
