use crate::common::*;

/// Channel count and stride of one feature level, as reported by the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub channels: i64,
    pub stride: i64,
}

/// Looks up the shapes of `names` in order.
pub(crate) fn select_shapes(
    input_shapes: &HashMap<String, ShapeSpec>,
    names: &[String],
) -> Result<Vec<ShapeSpec>> {
    ensure!(!names.is_empty(), "at least one input feature is required");
    names
        .iter()
        .map(|name| {
            input_shapes
                .get(name)
                .copied()
                .ok_or_else(|| format_err!("the input feature '{}' does not exist", name))
        })
        .try_collect()
}

/// Looks up the feature maps of `names` in order.
pub(crate) fn select_features<'a>(
    features: &'a HashMap<String, Tensor>,
    names: &[String],
) -> Result<Vec<&'a Tensor>> {
    names
        .iter()
        .map(|name| {
            features
                .get(name)
                .ok_or_else(|| format_err!("the feature map '{}' is missing", name))
        })
        .try_collect()
}
