//! Background convergence loop.
//!
//! Detects divergence between the volume records and backend ground
//! truth and drives corrective transitions. This is what makes the
//! coordinator crash-consistent: no transition's correctness depends on
//! the process that initiated it surviving to completion.

mod reconciler;


pub use reconciler::*;
