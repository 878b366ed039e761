pub use anyhow::{bail, ensure, format_err, Result};
pub use bbox::{prelude::*, RotatedRect, HW, XYXY};
pub use itertools::Itertools as _;
pub use log::warn;
pub use std::collections::BTreeMap;
pub use tch::{Device, IndexOp, Kind, Tensor};
