//! Weight/Bias Provider.
//!
//! [`WeightSet`] is the read-only coefficient store for one run: an ordered
//! list of [`LayerWeights`], each a flat kernel tensor plus a bias vector.
//! Stages reference layers by index.
//!
//! When a [`Network`](crate::network::Network) is compiled, every referenced
//! layer is checked against the shape its stage needs and converted into
//! typed parameters ([`ConvParams`], [`DenseParams`]). Incomplete or
//! mismatched weights are therefore a load-time failure, never discovered in
//! the middle of a forward pass.
//!
//! Convolution layers are stored as `[out, in, k, k]` and dense layers as
//! `[rows, cols]`, both row-major. A convolution with a sparse connectivity
//! table still carries the full `[out, in, k, k]` tensor; filters for
//! unconnected pairs are ignored.

use crate::error::{Error, Result};
use crate::tensors::{FeatureMap, FlattenOrder, TensorFloat};

/// Coefficients of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    shape: Vec<usize>,
    kernels: Vec<TensorFloat>,
    bias: Vec<TensorFloat>,
}

impl LayerWeights {
    /// Wraps a kernel tensor of `shape` and its bias vector.
    ///
    /// # Errors
    /// [`Error::Load`] if the shape is empty, has a zero extent, or does not
    /// match `kernels.len()`.
    pub fn new(
        shape: Vec<usize>,
        kernels: Vec<TensorFloat>,
        bias: Vec<TensorFloat>,
    ) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|&n| n > 0);
        if expected != Some(kernels.len()) {
            return Err(Error::load(
                "weight layer",
                format!(
                    "shape {shape:?} does not describe {} coefficients",
                    kernels.len()
                ),
            ));
        }
        Ok(Self {
            shape,
            kernels,
            bias,
        })
    }

    /// A layer whose coefficients are all `value`.
    ///
    /// # Errors
    /// Same as [`LayerWeights::new`].
    pub fn filled(shape: Vec<usize>, value: TensorFloat, bias: Vec<TensorFloat>) -> Result<Self> {
        let len = shape.iter().product();
        Self::new(shape, vec![value; len], bias)
    }

    /// Kernel tensor shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Row-major kernel coefficients.
    #[must_use]
    pub fn kernels(&self) -> &[TensorFloat] {
        &self.kernels
    }

    /// Bias vector.
    #[must_use]
    pub fn bias(&self) -> &[TensorFloat] {
        &self.bias
    }
}

/// All layers of one model, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightSet {
    layers: Vec<LayerWeights>,
}

impl WeightSet {
    /// Wraps `layers`.
    #[must_use]
    pub const fn new(layers: Vec<LayerWeights>) -> Self {
        Self { layers }
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// `true` if there are no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All layers.
    #[must_use]
    pub fn layers(&self) -> &[LayerWeights] {
        &self.layers
    }

    /// Layer `index`.
    ///
    /// # Errors
    /// [`Error::Load`] if the set has fewer layers.
    pub fn layer(&self, index: usize) -> Result<&LayerWeights> {
        self.layers.get(index).ok_or_else(|| {
            Error::load(
                format!("weight layer {index}"),
                format!("the weight set only has {} layers", self.layers.len()),
            )
        })
    }

    /// Consumes the set, returning its layers.
    #[must_use]
    pub fn into_layers(self) -> Vec<LayerWeights> {
        self.layers
    }
}

impl From<Vec<LayerWeights>> for WeightSet {
    fn from(layers: Vec<LayerWeights>) -> Self {
        Self::new(layers)
    }
}

fn expect_shape(index: usize, layer: &LayerWeights, shape: &[usize], bias: usize) -> Result<()> {
    if layer.shape() != shape {
        return Err(Error::load(
            format!("weight layer {index}"),
            format!("expected kernel shape {shape:?}, got {:?}", layer.shape()),
        ));
    }
    if layer.bias().len() != bias {
        return Err(Error::load(
            format!("weight layer {index}"),
            format!(
                "expected {bias} bias values, got {}",
                layer.bias().len()
            ),
        ));
    }
    Ok(())
}

/// Convolution filters split into per-(output, input) planes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvParams {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    filters: Vec<FeatureMap>,
    bias: Vec<TensorFloat>,
}

impl ConvParams {
    /// Checks that layer `index` has shape `[out, in, k, k]` with `out` biases
    /// and splits it into filter planes.
    ///
    /// # Errors
    /// [`Error::Load`] on any shape disagreement.
    pub fn from_layer(
        index: usize,
        layer: &LayerWeights,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Result<Self> {
        expect_shape(
            index,
            layer,
            &[out_channels, in_channels, kernel_size, kernel_size],
            out_channels,
        )?;
        let filters = layer
            .kernels()
            .chunks_exact(kernel_size * kernel_size)
            .map(|taps| FeatureMap::new(kernel_size, kernel_size, taps.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            in_channels,
            out_channels,
            kernel_size,
            filters,
            bias: layer.bias().to_vec(),
        })
    }

    /// Number of input channels.
    #[must_use]
    pub const fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    #[must_use]
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Filter edge length.
    #[must_use]
    pub const fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Filter connecting input channel `input` to output channel `output`.
    ///
    /// # Panics
    /// If either index is out of range.
    #[must_use]
    pub fn filter(&self, output: usize, input: usize) -> &FeatureMap {
        &self.filters[output * self.in_channels + input]
    }

    /// One bias per output channel.
    #[must_use]
    pub fn bias(&self) -> &[TensorFloat] {
        &self.bias
    }
}

/// A dense weight matrix together with the flattening order its columns use.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseParams {
    rows: usize,
    cols: usize,
    weights: Vec<TensorFloat>,
    bias: Vec<TensorFloat>,
    order: FlattenOrder,
}

impl DenseParams {
    /// A `rows × cols` matrix with `rows` biases.
    ///
    /// # Errors
    /// [`Error::Load`] if the lengths disagree with the extents.
    pub fn new(
        rows: usize,
        cols: usize,
        weights: Vec<TensorFloat>,
        bias: Vec<TensorFloat>,
        order: FlattenOrder,
    ) -> Result<Self> {
        let layer = LayerWeights::new(vec![rows, cols], weights, bias)?;
        Self::from_layer(0, &layer, cols, rows, order)
    }

    /// Checks that layer `index` has shape `[out, in]` with `out` biases.
    ///
    /// # Errors
    /// [`Error::Load`] on any shape disagreement.
    pub fn from_layer(
        index: usize,
        layer: &LayerWeights,
        in_features: usize,
        out_features: usize,
        order: FlattenOrder,
    ) -> Result<Self> {
        expect_shape(index, layer, &[out_features, in_features], out_features)?;
        Ok(Self {
            rows: out_features,
            cols: in_features,
            weights: layer.kernels().to_vec(),
            bias: layer.bias().to_vec(),
            order,
        })
    }

    /// Input length `N`.
    #[must_use]
    pub const fn in_features(&self) -> usize {
        self.cols
    }

    /// Output length `M`.
    #[must_use]
    pub const fn out_features(&self) -> usize {
        self.rows
    }

    /// Row `m` of the matrix.
    #[must_use]
    pub fn row(&self, m: usize) -> &[TensorFloat] {
        &self.weights[m * self.cols..(m + 1) * self.cols]
    }

    /// The whole row-major matrix.
    #[must_use]
    pub fn weights(&self) -> &[TensorFloat] {
        &self.weights
    }

    /// Bias vector.
    #[must_use]
    pub fn bias(&self) -> &[TensorFloat] {
        &self.bias
    }

    /// Flattening order the columns follow.
    #[must_use]
    pub const fn order(&self) -> FlattenOrder {
        self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_rejects_inconsistent_shape() {
        assert!(LayerWeights::new(vec![2, 3], vec![0.0; 5], vec![]).is_err());
        assert!(LayerWeights::new(vec![], vec![], vec![]).is_err());
        assert!(LayerWeights::new(vec![2, 0], vec![], vec![]).is_err());
    }

    #[test]
    fn conv_params_split_filters_in_order() {
        let kernels: Vec<f32> = (0..2 * 3 * 4).map(|v| v as f32).collect();
        let layer = LayerWeights::new(vec![2, 3, 2, 2], kernels, vec![0.5, -0.5]).unwrap();
        let conv = ConvParams::from_layer(0, &layer, 3, 2, 2).unwrap();
        assert_eq!(conv.filter(0, 0).data(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(conv.filter(1, 2).data(), &[20.0, 21.0, 22.0, 23.0]);
        assert_eq!(conv.bias(), &[0.5, -0.5]);
    }

    #[test]
    fn conv_params_report_wrong_shape() {
        let layer = LayerWeights::filled(vec![4, 1, 5, 5], 0.0, vec![0.0; 4]).unwrap();
        let err = ConvParams::from_layer(3, &layer, 1, 6, 5).unwrap_err();
        assert!(err.to_string().contains("weight layer 3"));
        assert!(err.to_string().contains("[6, 1, 5, 5]"));
    }

    #[test]
    fn dense_params_check_bias_length() {
        let err = DenseParams::new(2, 2, vec![0.0; 4], vec![0.0], FlattenOrder::ChannelMajor)
            .unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
    }

    #[test]
    fn missing_layer_is_a_load_error() {
        let set = WeightSet::default();
        assert!(matches!(set.layer(0), Err(Error::Load { .. })));
    }
}
