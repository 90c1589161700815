//! Spectrogram assembly and export.
//!
//! A spectrogram is the ordered sequence of background-subtracted spectra
//! collected across one delay scan. Rows are appended incrementally while the
//! scan runs; a snapshot taken at any point (including after a cancelled or
//! failed scan) contains every row emitted so far.

use chrono::{DateTime, Utc};

#[cfg(feature = "storage_csv")]
use std::path::Path;

#[cfg(feature = "storage_csv")]
use crate::error::FrogResult;

/// Background subtraction with the physical non-negativity clamp:
/// `max(raw - ambient, 0)` elementwise. Missing baseline bins subtract zero.
pub fn subtract_ambient(raw: &[f64], ambient: &[f64]) -> Vec<f64> {
    raw.iter()
        .enumerate()
        .map(|(i, value)| (value - ambient.get(i).copied().unwrap_or(0.0)).max(0.0))
        .collect()
}

/// 2D intensity-vs-wavelength data collected across a delay scan.
#[derive(Clone, Debug)]
pub struct Spectrogram {
    /// Wavelength axis shared by every row, in nanometers.
    pub wavelengths: Vec<f64>,
    /// Optical delay of each row, in femtoseconds.
    pub delays_fs: Vec<f64>,
    /// Background-subtracted intensities, one row per scan step.
    pub rows: Vec<Vec<f64>>,
    /// When collection began.
    pub started_at: DateTime<Utc>,
}

impl Spectrogram {
    /// Start an empty spectrogram over the given wavelength axis.
    pub fn new(wavelengths: Vec<f64>) -> Self {
        Self {
            wavelengths,
            delays_fs: Vec::new(),
            rows: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Append one scan step.
    pub fn push_row(&mut self, delay_fs: f64, intensities: Vec<f64>) {
        self.delays_fs.push(delay_fs);
        self.rows.push(intensities);
    }

    /// Number of rows collected so far.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows have been collected.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the spectrogram to a CSV writer.
    ///
    /// Layout matches the lab's long-standing text export: the first row is
    /// `NaN` followed by the wavelength axis; each subsequent row is the
    /// step's delay in femtoseconds followed by its intensities.
    #[cfg(feature = "storage_csv")]
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> FrogResult<()> {
        let mut csv = csv::Writer::from_writer(writer);

        let mut header = Vec::with_capacity(self.wavelengths.len() + 1);
        header.push("NaN".to_string());
        header.extend(self.wavelengths.iter().map(|wl| wl.to_string()));
        csv.write_record(&header)?;

        for (delay_fs, row) in self.delays_fs.iter().zip(&self.rows) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(delay_fs.to_string());
            record.extend(row.iter().map(|v| v.to_string()));
            csv.write_record(&record)?;
        }

        csv.flush()?;
        Ok(())
    }

    /// Write the spectrogram to a CSV file.
    #[cfg(feature = "storage_csv")]
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> FrogResult<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv(file)
    }
}
