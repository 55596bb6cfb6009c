//! Reordering of spectrometer memory into natural frequency order.
//!
//! The FFT engine emits its bins in bit-reversed order, and the memory
//! controller splits every run of 16 consecutive words between two banks,
//! 8 words each. [`PermutationTable`] precomputes where every word of each
//! bank belongs in the canonical spectrum, and [`SpectrumAssembler`] applies
//! it to the raw bank contents.

use crate::device::MemoryBank;
use crate::error::AssemblyError;
use ndarray::Array1;
use std::sync::Arc;

/// Number of consecutive words written to one bank before switching to the other.
pub const INTERLEAVE_WIDTH: usize = 8;

/// Reverses the lowest `bits` bits of `index`.
pub fn bit_reverse(index: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    index.reverse_bits() >> (usize::BITS - bits)
}

/// Bit-reversal permutation of `0..len`. `len` must be a power of two.
pub fn bit_reversal_permutation(len: usize) -> Vec<usize> {
    debug_assert!(len.is_power_of_two());
    let bits = len.trailing_zeros();
    (0..len).map(|i| bit_reverse(i, bits)).collect()
}

/// Spectrum position of every word held in the two memory banks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutationTable {
    transform_length: u32,
    is_complex: bool,
    bank_a: Vec<usize>,
    bank_b: Vec<usize>,
}

impl PermutationTable {
    /// Builds the table for an FFT of `transform_length` points.
    ///
    /// Real data produces `transform_length / 2` bins, complex data produces
    /// `transform_length` bins with negative frequencies first.
    pub fn new(transform_length: u32, is_complex: bool) -> Result<Self, AssemblyError> {
        let n = transform_length as usize;
        if !n.is_power_of_two() {
            return Err(AssemblyError::InvalidTransformLength(transform_length));
        }
        let bins = if is_complex { n } else { n / 2 };
        if bins < 2 * INTERLEAVE_WIDTH {
            return Err(AssemblyError::InvalidTransformLength(transform_length));
        }

        let order = bit_reversal_permutation(bins);
        let mut bank_a = Vec::with_capacity(bins / 2);
        let mut bank_b = Vec::with_capacity(bins / 2);
        for block in order.chunks_exact(2 * INTERLEAVE_WIDTH) {
            bank_a.extend_from_slice(&block[..INTERLEAVE_WIDTH]);
            bank_b.extend_from_slice(&block[INTERLEAVE_WIDTH..]);
        }

        if is_complex {
            // Swap halves so the spectrum is centred on zero frequency.
            let half = n / 2;
            for index in bank_a.iter_mut().chain(bank_b.iter_mut()) {
                *index = if *index < half {
                    *index + half
                } else {
                    *index - half
                };
            }
        }

        Ok(Self {
            transform_length,
            is_complex,
            bank_a,
            bank_b,
        })
    }

    pub fn transform_length(&self) -> u32 {
        self.transform_length
    }

    pub fn is_complex(&self) -> bool {
        self.is_complex
    }

    /// Number of words held by each bank.
    pub fn bank_len(&self) -> usize {
        self.bank_a.len()
    }

    /// Length of the assembled spectrum.
    pub fn spectrum_len(&self) -> usize {
        self.bank_a.len() + self.bank_b.len()
    }

    pub fn indices(&self, bank: MemoryBank) -> &[usize] {
        match bank {
            MemoryBank::A => &self.bank_a,
            MemoryBank::B => &self.bank_b,
        }
    }
}

/// Applies a shared [`PermutationTable`] to raw bank data.
///
/// Cloning is cheap and clones share the same table, so one assembler can be
/// handed to any number of threads.
#[derive(Debug, Clone)]
pub struct SpectrumAssembler {
    table: Arc<PermutationTable>,
}

impl SpectrumAssembler {
    pub fn new(transform_length: u32, is_complex: bool) -> Result<Self, AssemblyError> {
        Ok(Self {
            table: Arc::new(PermutationTable::new(transform_length, is_complex)?),
        })
    }

    pub fn table(&self) -> &PermutationTable {
        &self.table
    }

    /// Whether this assembler was built for the given transform configuration.
    pub fn matches(&self, transform_length: u32, is_complex: bool) -> bool {
        self.table.transform_length == transform_length && self.table.is_complex == is_complex
    }

    /// Scatters both banks into a spectrum in natural frequency order.
    pub fn assemble(&self, bank_a: &[f64], bank_b: &[f64]) -> Result<Array1<f64>, AssemblyError> {
        self.check_len(MemoryBank::A, bank_a)?;
        self.check_len(MemoryBank::B, bank_b)?;

        let mut spectrum = Array1::<f64>::zeros(self.table.spectrum_len());
        for (&index, &value) in self.table.bank_a.iter().zip(bank_a) {
            spectrum[index] = value;
        }
        for (&index, &value) in self.table.bank_b.iter().zip(bank_b) {
            spectrum[index] = value;
        }
        Ok(spectrum)
    }

    /// Inverse of [`assemble`](Self::assemble): lays a canonical spectrum out
    /// the way the hardware stores it.
    pub fn scatter(&self, spectrum: &[f64]) -> Result<(Vec<f64>, Vec<f64>), AssemblyError> {
        if spectrum.len() != self.table.spectrum_len() {
            return Err(AssemblyError::LengthMismatch {
                bank: MemoryBank::A,
                expected: self.table.spectrum_len(),
                actual: spectrum.len(),
            });
        }
        let bank_a = self.table.bank_a.iter().map(|&i| spectrum[i]).collect();
        let bank_b = self.table.bank_b.iter().map(|&i| spectrum[i]).collect();
        Ok((bank_a, bank_b))
    }

    fn check_len(&self, bank: MemoryBank, data: &[f64]) -> Result<(), AssemblyError> {
        let expected = self.table.bank_len();
        if data.len() != expected {
            return Err(AssemblyError::LengthMismatch {
                bank,
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}
