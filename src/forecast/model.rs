//! The stacked ConvLSTM forecaster: three convolutional LSTM layers with
//! batch normalization and dropout, a flatten, two relu dense layers and a
//! sigmoid output reshaped back into a frame. Only the last LSTM layer's
//! final hidden state feeds the dense head.

use anyhow::Result;
use ndarray::{Array1, Array3, Array4, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;

use crate::config::ModelConfig;
use crate::forecast::layers::{
    dropout_mask, sigmoid, BatchNorm, BnCache, BnGrads, ConvLstm2d, ConvLstmCache, ConvLstmGrads,
    Dense, DenseGrads,
};

pub struct ConvLstmNet {
    lstm: Vec<ConvLstm2d>,
    norm: Vec<BatchNorm>,
    /// Dropout rate applied to each LSTM block's normalized output; the last
    /// block's entry is always zero.
    seq_dropout: Vec<f32>,
    hidden: Vec<Dense>,
    dense_dropout: f32,
    output: Dense,
    height: usize,
    width: usize,
    channels: usize,
}

struct BlockCache {
    lstm: ConvLstmCache,
    bn: BnCache,
    mask: Option<Array4<f32>>,
}

struct DenseCache {
    input: Array1<f32>,
    pre: Array1<f32>,
    mask: Option<Array1<f32>>,
}

pub struct ForwardCache {
    blocks: Vec<BlockCache>,
    flat_input: Array1<f32>,
    dense: Vec<DenseCache>,
    output_input: Array1<f32>,
    pub output: Array3<f32>,
}

pub struct NetGrads {
    pub lstm: Vec<ConvLstmGrads>,
    pub norm: Vec<BnGrads>,
    pub hidden: Vec<DenseGrads>,
    pub output: DenseGrads,
}

impl NetGrads {
    pub fn zeros_like(net: &ConvLstmNet) -> Self {
        Self {
            lstm: net.lstm.iter().map(ConvLstmGrads::zeros_like).collect(),
            norm: net.norm.iter().map(BnGrads::zeros_like).collect(),
            hidden: net.hidden.iter().map(DenseGrads::zeros_like).collect(),
            output: DenseGrads::zeros_like(&net.output),
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for mut view in self.views_mut() {
            view.map_inplace(|v| *v *= factor);
        }
    }

    /// Gradient arrays in the same order as `ConvLstmNet::param_views_mut`.
    pub fn views(&self) -> Vec<ArrayViewD<f32>> {
        let mut out = Vec::new();
        for (g, n) in self.lstm.iter().zip(&self.norm) {
            out.push(g.wx.view().into_dyn());
            out.push(g.wh.view().into_dyn());
            out.push(g.bias.view().into_dyn());
            out.push(n.gamma.view().into_dyn());
            out.push(n.beta.view().into_dyn());
        }
        for g in &self.hidden {
            out.push(g.w.view().into_dyn());
            out.push(g.b.view().into_dyn());
        }
        out.push(self.output.w.view().into_dyn());
        out.push(self.output.b.view().into_dyn());
        out
    }

    fn views_mut(&mut self) -> Vec<ArrayViewMutD<f32>> {
        let mut out = Vec::new();
        for (g, n) in self.lstm.iter_mut().zip(&mut self.norm) {
            out.push(g.wx.view_mut().into_dyn());
            out.push(g.wh.view_mut().into_dyn());
            out.push(g.bias.view_mut().into_dyn());
            out.push(n.gamma.view_mut().into_dyn());
            out.push(n.beta.view_mut().into_dyn());
        }
        for g in &mut self.hidden {
            out.push(g.w.view_mut().into_dyn());
            out.push(g.b.view_mut().into_dyn());
        }
        out.push(self.output.w.view_mut().into_dyn());
        out.push(self.output.b.view_mut().into_dyn());
        out
    }
}

impl ConvLstmNet {
    pub fn new(
        config: &ModelConfig,
        height: usize,
        width: usize,
        channels: usize,
        rng: &mut StdRng,
    ) -> Self {
        let mut lstm = Vec::with_capacity(config.filters.len());
        let mut norm = Vec::with_capacity(config.filters.len());
        let mut seq_dropout = Vec::with_capacity(config.filters.len());
        let mut in_channels = channels;
        for (b, (&filters, &kernel)) in config.filters.iter().zip(&config.kernels).enumerate() {
            lstm.push(ConvLstm2d::new(in_channels, filters, kernel, rng));
            norm.push(BatchNorm::new(filters));
            let last = b + 1 == config.filters.len();
            let rate = if last {
                0.0
            } else {
                config.recurrent_dropout.get(b).copied().unwrap_or(0.0)
            };
            seq_dropout.push(rate);
            in_channels = filters;
        }

        let mut hidden = Vec::with_capacity(config.dense_units.len());
        let mut inputs = height * width * in_channels;
        for &units in &config.dense_units {
            hidden.push(Dense::new(inputs, units, rng));
            inputs = units;
        }
        let output = Dense::new(inputs, height * width * channels, rng);

        Self {
            lstm,
            norm,
            seq_dropout,
            hidden,
            dense_dropout: config.dense_dropout,
            output,
            height,
            width,
            channels,
        }
    }

    /// Trainable parameters in a fixed order matching `NetGrads::views`.
    pub fn param_views_mut(&mut self) -> Vec<ArrayViewMutD<f32>> {
        let mut out = Vec::new();
        for (l, n) in self.lstm.iter_mut().zip(&mut self.norm) {
            out.push(l.wx.view_mut().into_dyn());
            out.push(l.wh.view_mut().into_dyn());
            out.push(l.bias.view_mut().into_dyn());
            out.push(n.gamma.view_mut().into_dyn());
            out.push(n.beta.view_mut().into_dyn());
        }
        for d in &mut self.hidden {
            out.push(d.w.view_mut().into_dyn());
            out.push(d.b.view_mut().into_dyn());
        }
        out.push(self.output.w.view_mut().into_dyn());
        out.push(self.output.b.view_mut().into_dyn());
        out
    }

    /// Training-mode forward pass over one (time, h, w, c) window. Batch
    /// normalization uses batch statistics and updates running averages;
    /// dropout draws fresh masks from `rng`.
    pub fn forward_train(&mut self, x: &Array4<f32>, rng: &mut StdRng) -> Result<ForwardCache> {
        let n_blocks = self.lstm.len();
        let mut blocks = Vec::with_capacity(n_blocks);
        let mut seq = x.clone();
        let mut flat_input = Array1::zeros(0);

        for b in 0..n_blocks {
            let cache = self.lstm[b].forward(&seq);
            let filters = self.lstm[b].filters;
            let (t_len, h, w, _) = cache.hs.dim();
            if b + 1 < n_blocks {
                let flat = cache
                    .hs
                    .clone()
                    .into_shape_with_order((t_len * h * w, filters))?;
                let (y, bn) = self.norm[b].forward_train(&flat);
                let mut y4 = y.into_shape_with_order((t_len, h, w, filters))?;
                let mask = if self.seq_dropout[b] > 0.0 {
                    let m = dropout_mask(&y4, self.seq_dropout[b], rng);
                    y4 = &y4 * &m;
                    Some(m)
                } else {
                    None
                };
                blocks.push(BlockCache { lstm: cache, bn, mask });
                seq = y4;
            } else {
                let last = cache.hs.index_axis(Axis(0), t_len - 1).to_owned();
                let flat = last.into_shape_with_order((h * w, filters))?;
                let (y, bn) = self.norm[b].forward_train(&flat);
                flat_input = y.into_shape_with_order(h * w * filters)?;
                blocks.push(BlockCache { lstm: cache, bn, mask: None });
            }
        }

        let mut dense = Vec::with_capacity(self.hidden.len());
        let mut act = flat_input.clone();
        for (i, layer) in self.hidden.iter().enumerate() {
            let pre = layer.forward(&act);
            let mut post = pre.mapv(|v| v.max(0.0));
            let mask = if i == 0 && self.dense_dropout > 0.0 {
                let m = dropout_mask(&post, self.dense_dropout, rng);
                post = &post * &m;
                Some(m)
            } else {
                None
            };
            dense.push(DenseCache { input: act, pre, mask });
            act = post;
        }

        let logits = self.output.forward(&act);
        let output = logits
            .mapv(sigmoid)
            .into_shape_with_order((self.height, self.width, self.channels))?;

        Ok(ForwardCache {
            blocks,
            flat_input,
            dense,
            output_input: act,
            output,
        })
    }

    /// Inference-mode forward pass: running batch statistics, no dropout.
    pub fn predict(&self, x: &Array4<f32>) -> Result<Array3<f32>> {
        let n_blocks = self.lstm.len();
        let mut seq = x.clone();
        let mut flat_input = Array1::zeros(0);
        for b in 0..n_blocks {
            let cache = self.lstm[b].forward(&seq);
            let filters = self.lstm[b].filters;
            let (t_len, h, w, _) = cache.hs.dim();
            if b + 1 < n_blocks {
                let flat = cache
                    .hs
                    .clone()
                    .into_shape_with_order((t_len * h * w, filters))?;
                let y = self.norm[b].forward_eval(&flat);
                seq = y.into_shape_with_order((t_len, h, w, filters))?;
            } else {
                let last = cache.hs.index_axis(Axis(0), t_len - 1).to_owned();
                let flat = last.into_shape_with_order((h * w, filters))?;
                let y = self.norm[b].forward_eval(&flat);
                flat_input = y.into_shape_with_order(h * w * filters)?;
            }
        }

        let mut act = flat_input;
        for layer in &self.hidden {
            act = layer.forward(&act).mapv(|v| v.max(0.0));
        }
        let logits = self.output.forward(&act);
        Ok(logits
            .mapv(sigmoid)
            .into_shape_with_order((self.height, self.width, self.channels))?)
    }

    /// Backpropagate the output gradient through the whole network,
    /// accumulating into `grads`.
    pub fn backward(
        &self,
        cache: &ForwardCache,
        dout: &Array3<f32>,
        grads: &mut NetGrads,
    ) -> Result<()> {
        let out_len = self.height * self.width * self.channels;
        let dy = dout.clone().into_shape_with_order(out_len)?;
        let y = cache.output.clone().into_shape_with_order(out_len)?;
        // sigmoid'
        let dlogits = &dy * &(&y * &y.mapv(|v| 1.0 - v));

        let mut dx = self
            .output
            .backward(&cache.output_input, &dlogits, &mut grads.output);

        for i in (0..self.hidden.len()).rev() {
            let dc = &cache.dense[i];
            let mut da = dx;
            if let Some(mask) = &dc.mask {
                da = &da * mask;
            }
            let dpre = &da * &dc.pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
            dx = self.hidden[i].backward(&dc.input, &dpre, &mut grads.hidden[i]);
        }

        let n_blocks = self.lstm.len();
        let f_last = self.lstm[n_blocks - 1].filters;
        let (h, w) = (self.height, self.width);
        let d2 = dx.into_shape_with_order((h * w, f_last))?;
        let dflat =
            self.norm[n_blocks - 1].backward(&cache.blocks[n_blocks - 1].bn, &d2, &mut grads.norm[n_blocks - 1]);
        let dh_last = dflat.into_shape_with_order((h, w, f_last))?;

        let t_len = cache.blocks[n_blocks - 1].lstm.hs.dim().0;
        let mut dh_out = Array4::<f32>::zeros((t_len, h, w, f_last));
        dh_out.index_axis_mut(Axis(0), t_len - 1).assign(&dh_last);
        let mut dseq = self.lstm[n_blocks - 1].backward(
            &cache.blocks[n_blocks - 1].lstm,
            &dh_out,
            &mut grads.lstm[n_blocks - 1],
        );

        for b in (0..n_blocks - 1).rev() {
            if let Some(mask) = &cache.blocks[b].mask {
                dseq = &dseq * mask;
            }
            let filters = self.lstm[b].filters;
            let d2 = dseq.into_shape_with_order((t_len * h * w, filters))?;
            let db = self.norm[b].backward(&cache.blocks[b].bn, &d2, &mut grads.norm[b]);
            let dh = db.into_shape_with_order((t_len, h, w, filters))?;
            dseq = self.lstm[b].backward(&cache.blocks[b].lstm, &dh, &mut grads.lstm[b]);
        }
        Ok(())
    }
}
