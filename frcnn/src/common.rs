pub use anyhow::{bail, ensure, format_err, Context as _, Result};
pub use bbox::{prelude::*, Transform, HW, XYXY};
pub use getset::Getters;
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    f64::consts::PI,
    fs,
    path::Path,
};
pub use tch::{
    nn::{self, Module as _, ModuleT as _},
    Device, Kind, Reduction, Tensor,
};
pub use tch_goodies::{BoxError, BoxSet, Boxes, RotatedBoxes, TensorExt as _};
