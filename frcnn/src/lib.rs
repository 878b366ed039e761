//! The building blocks of two-stage region-based detection models.
//!
//! Feature maps come from an external backbone. This crate turns them into
//! anchors, region proposals, pooled region features and final per-class
//! detections, and computes the training losses of both stages.

mod common;
pub mod anchor;
pub mod box_transform;
pub mod config;
pub mod instances;
pub mod loss;
pub mod matcher;
pub mod model;
pub mod norm;
pub mod pooler;
pub mod postprocess;
pub mod roi_heads;
pub mod rpn;
pub mod sampling;
pub mod shape;
