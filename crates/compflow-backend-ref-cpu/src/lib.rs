pub mod cpu;

pub use cpu::{CpuBackend, CpuNetwork};
