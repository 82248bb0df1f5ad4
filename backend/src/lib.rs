//! Chest X-ray super-resolution service.
//!
//! Uploaded radiographs are stored under unique names, then enhanced on
//! request by a learned super-resolution network wrapped in fixed pre- and
//! post-processing. When no trained model can be loaded the service keeps
//! answering with byte-identical copies.

pub mod arch;
pub mod checkpoint;
pub mod config;
pub mod enhancer;
pub mod imaging;
pub mod lifecycle;
pub mod nn;
pub mod pipeline;
pub mod routes;
pub mod storage;
