//! Layer primitives for the frame-forecasting network: same-padding 2-D
//! convolution, a convolutional LSTM cell with backpropagation through time,
//! per-channel batch normalization, dense layers and inverted dropout.
//! Tensors are channels-last, f32, single-sample.

use ndarray::{s, Array, Array1, Array2, Array3, Array4, ArrayView3, ArrayViewMut3, Axis, Dimension};
use rand::rngs::StdRng;
use rand::Rng;

#[inline]
pub(crate) fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn glorot_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out) as f32).sqrt()
}

/// Same-padding stride-1 convolution, accumulated into `out`.
/// Shapes: input (h, w, cin), kernel (kh, kw, cin, cout), out (h, w, cout).
pub fn conv2d_accumulate(input: ArrayView3<f32>, kernel: &Array4<f32>, out: &mut Array3<f32>) {
    let (h, w, cin) = input.dim();
    let (kh, kw, _, cout) = kernel.dim();
    let (ph, pw) = (kh / 2, kw / 2);
    for y in 0..h {
        for x in 0..w {
            for dy in 0..kh {
                let iy = (y + dy).wrapping_sub(ph);
                if iy >= h {
                    continue;
                }
                for dx in 0..kw {
                    let ix = (x + dx).wrapping_sub(pw);
                    if ix >= w {
                        continue;
                    }
                    for ic in 0..cin {
                        let v = input[[iy, ix, ic]];
                        if v == 0.0 {
                            continue;
                        }
                        for oc in 0..cout {
                            out[[y, x, oc]] += v * kernel[[dy, dx, ic, oc]];
                        }
                    }
                }
            }
        }
    }
}

/// Backward pass of `conv2d_accumulate`: accumulates the kernel gradient and,
/// when requested, the input gradient.
pub fn conv2d_backward(
    input: ArrayView3<f32>,
    kernel: &Array4<f32>,
    dout: &Array3<f32>,
    mut dinput: Option<ArrayViewMut3<f32>>,
    dkernel: &mut Array4<f32>,
) {
    let (h, w, cin) = input.dim();
    let (kh, kw, _, cout) = kernel.dim();
    let (ph, pw) = (kh / 2, kw / 2);
    for y in 0..h {
        for x in 0..w {
            for dy in 0..kh {
                let iy = (y + dy).wrapping_sub(ph);
                if iy >= h {
                    continue;
                }
                for dx in 0..kw {
                    let ix = (x + dx).wrapping_sub(pw);
                    if ix >= w {
                        continue;
                    }
                    for ic in 0..cin {
                        let v = input[[iy, ix, ic]];
                        let mut dv = 0.0;
                        for oc in 0..cout {
                            let g = dout[[y, x, oc]];
                            dkernel[[dy, dx, ic, oc]] += v * g;
                            dv += kernel[[dy, dx, ic, oc]] * g;
                        }
                        if let Some(di) = dinput.as_mut() {
                            di[[iy, ix, ic]] += dv;
                        }
                    }
                }
            }
        }
    }
}

/// Convolutional LSTM over a (time, h, w, channels) sequence. Gates are
/// sigmoid, the cell candidate and cell output use relu, and the forget-gate
/// bias starts at one. Gate layout along the channel axis: i, f, g, o.
pub struct ConvLstm2d {
    pub filters: usize,
    pub wx: Array4<f32>,
    pub wh: Array4<f32>,
    pub bias: Array1<f32>,
}

pub struct ConvLstmCache {
    pub x: Array4<f32>,
    pub i: Array4<f32>,
    pub f: Array4<f32>,
    pub g: Array4<f32>,
    pub o: Array4<f32>,
    pub c: Array4<f32>,
    pub hs: Array4<f32>,
}

pub struct ConvLstmGrads {
    pub wx: Array4<f32>,
    pub wh: Array4<f32>,
    pub bias: Array1<f32>,
}

impl ConvLstmGrads {
    pub fn zeros_like(layer: &ConvLstm2d) -> Self {
        Self {
            wx: Array4::zeros(layer.wx.dim()),
            wh: Array4::zeros(layer.wh.dim()),
            bias: Array1::zeros(layer.bias.dim()),
        }
    }
}

impl ConvLstm2d {
    pub fn new(in_channels: usize, filters: usize, kernel: usize, rng: &mut StdRng) -> Self {
        let lx = glorot_limit(kernel * kernel * in_channels, kernel * kernel * filters);
        let lh = glorot_limit(kernel * kernel * filters, kernel * kernel * filters);
        let wx = Array4::from_shape_fn((kernel, kernel, in_channels, 4 * filters), |_| {
            rng.gen_range(-lx..lx)
        });
        let wh = Array4::from_shape_fn((kernel, kernel, filters, 4 * filters), |_| {
            rng.gen_range(-lh..lh)
        });
        let mut bias = Array1::zeros(4 * filters);
        bias.slice_mut(s![filters..2 * filters]).fill(1.0);
        Self { filters, wx, wh, bias }
    }

    /// Run the full sequence; the cache holds every timestep's activations
    /// for backpropagation through time.
    pub fn forward(&self, x: &Array4<f32>) -> ConvLstmCache {
        let (t_len, h, w, _) = x.dim();
        let f_n = self.filters;
        let mut cache = ConvLstmCache {
            x: x.clone(),
            i: Array4::zeros((t_len, h, w, f_n)),
            f: Array4::zeros((t_len, h, w, f_n)),
            g: Array4::zeros((t_len, h, w, f_n)),
            o: Array4::zeros((t_len, h, w, f_n)),
            c: Array4::zeros((t_len, h, w, f_n)),
            hs: Array4::zeros((t_len, h, w, f_n)),
        };

        for t in 0..t_len {
            let mut pre = Array3::<f32>::zeros((h, w, 4 * f_n));
            conv2d_accumulate(x.index_axis(Axis(0), t), &self.wx, &mut pre);
            if t > 0 {
                let h_prev = cache.hs.index_axis(Axis(0), t - 1).to_owned();
                conv2d_accumulate(h_prev.view(), &self.wh, &mut pre);
            }
            for y in 0..h {
                for xw in 0..w {
                    for j in 0..f_n {
                        let iv = sigmoid(pre[[y, xw, j]] + self.bias[j]);
                        let fv = sigmoid(pre[[y, xw, f_n + j]] + self.bias[f_n + j]);
                        let gv = (pre[[y, xw, 2 * f_n + j]] + self.bias[2 * f_n + j]).max(0.0);
                        let ov = sigmoid(pre[[y, xw, 3 * f_n + j]] + self.bias[3 * f_n + j]);
                        let c_prev = if t > 0 { cache.c[[t - 1, y, xw, j]] } else { 0.0 };
                        let cv = fv * c_prev + iv * gv;
                        cache.i[[t, y, xw, j]] = iv;
                        cache.f[[t, y, xw, j]] = fv;
                        cache.g[[t, y, xw, j]] = gv;
                        cache.o[[t, y, xw, j]] = ov;
                        cache.c[[t, y, xw, j]] = cv;
                        cache.hs[[t, y, xw, j]] = ov * cv.max(0.0);
                    }
                }
            }
        }
        cache
    }

    /// Backpropagation through time. `dh_out` carries the upstream gradient
    /// per timestep (zero slices for timesteps without loss contribution).
    /// Returns the gradient with respect to the input sequence.
    pub fn backward(
        &self,
        cache: &ConvLstmCache,
        dh_out: &Array4<f32>,
        grads: &mut ConvLstmGrads,
    ) -> Array4<f32> {
        let (t_len, h, w, cin) = cache.x.dim();
        let f_n = self.filters;
        let mut dx = Array4::<f32>::zeros((t_len, h, w, cin));
        let mut dh_next = Array3::<f32>::zeros((h, w, f_n));
        let mut dc_next = Array3::<f32>::zeros((h, w, f_n));

        for t in (0..t_len).rev() {
            let mut dpre = Array3::<f32>::zeros((h, w, 4 * f_n));
            let mut dc_prev = Array3::<f32>::zeros((h, w, f_n));
            for y in 0..h {
                for xw in 0..w {
                    for j in 0..f_n {
                        let iv = cache.i[[t, y, xw, j]];
                        let fv = cache.f[[t, y, xw, j]];
                        let gv = cache.g[[t, y, xw, j]];
                        let ov = cache.o[[t, y, xw, j]];
                        let cv = cache.c[[t, y, xw, j]];
                        let c_prev = if t > 0 { cache.c[[t - 1, y, xw, j]] } else { 0.0 };

                        let dh = dh_out[[t, y, xw, j]] + dh_next[[y, xw, j]];
                        let dov = dh * cv.max(0.0);
                        let dcv = dc_next[[y, xw, j]]
                            + dh * ov * if cv > 0.0 { 1.0 } else { 0.0 };
                        let div = dcv * gv;
                        let dgv = dcv * iv;
                        let dfv = dcv * c_prev;
                        dc_prev[[y, xw, j]] = dcv * fv;

                        dpre[[y, xw, j]] = div * iv * (1.0 - iv);
                        dpre[[y, xw, f_n + j]] = dfv * fv * (1.0 - fv);
                        dpre[[y, xw, 2 * f_n + j]] = if gv > 0.0 { dgv } else { 0.0 };
                        dpre[[y, xw, 3 * f_n + j]] = dov * ov * (1.0 - ov);
                    }
                }
            }
            dc_next = dc_prev;

            for j in 0..4 * f_n {
                grads.bias[j] += dpre.slice(s![.., .., j]).sum();
            }
            conv2d_backward(
                cache.x.index_axis(Axis(0), t),
                &self.wx,
                &dpre,
                Some(dx.index_axis_mut(Axis(0), t)),
                &mut grads.wx,
            );
            if t > 0 {
                let mut dh_prev = Array3::<f32>::zeros((h, w, f_n));
                conv2d_backward(
                    cache.hs.index_axis(Axis(0), t - 1),
                    &self.wh,
                    &dpre,
                    Some(dh_prev.view_mut()),
                    &mut grads.wh,
                );
                dh_next = dh_prev;
            } else {
                dh_next.fill(0.0);
            }
        }
        dx
    }
}

/// Per-channel batch normalization over a (positions, channels) view.
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub momentum: f32,
    pub eps: f32,
}

pub struct BnCache {
    pub x_hat: Array2<f32>,
    pub inv_std: Array1<f32>,
}

pub struct BnGrads {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

impl BnGrads {
    pub fn zeros_like(layer: &BatchNorm) -> Self {
        Self {
            gamma: Array1::zeros(layer.gamma.dim()),
            beta: Array1::zeros(layer.beta.dim()),
        }
    }
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            momentum: 0.99,
            eps: 1e-3,
        }
    }

    pub fn forward_train(&mut self, x: &Array2<f32>) -> (Array2<f32>, BnCache) {
        let n = x.nrows() as f32;
        let mean = x.sum_axis(Axis(0)) / n;
        let centered = x - &mean;
        let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n;
        let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let x_hat = &centered * &inv_std;
        let y = &x_hat * &self.gamma + &self.beta;

        self.running_mean = &self.running_mean * self.momentum + &(&mean * (1.0 - self.momentum));
        self.running_var = &self.running_var * self.momentum + &(&var * (1.0 - self.momentum));

        (y, BnCache { x_hat, inv_std })
    }

    pub fn forward_eval(&self, x: &Array2<f32>) -> Array2<f32> {
        let inv_std = self.running_var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let x_hat = (x - &self.running_mean) * &inv_std;
        &x_hat * &self.gamma + &self.beta
    }

    pub fn backward(
        &self,
        cache: &BnCache,
        dout: &Array2<f32>,
        grads: &mut BnGrads,
    ) -> Array2<f32> {
        let n = dout.nrows() as f32;
        grads.gamma += &(dout * &cache.x_hat).sum_axis(Axis(0));
        grads.beta += &dout.sum_axis(Axis(0));

        let dx_hat = dout * &self.gamma;
        let sum_dx_hat = dx_hat.sum_axis(Axis(0));
        let sum_dx_hat_x_hat = (&dx_hat * &cache.x_hat).sum_axis(Axis(0));
        ((&dx_hat * n - &sum_dx_hat - &cache.x_hat * &sum_dx_hat_x_hat) * &cache.inv_std) / n
    }
}

/// Fully connected layer; weights are (inputs, outputs).
pub struct Dense {
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

pub struct DenseGrads {
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

impl DenseGrads {
    pub fn zeros_like(layer: &Dense) -> Self {
        Self {
            w: Array2::zeros(layer.w.dim()),
            b: Array1::zeros(layer.b.dim()),
        }
    }
}

impl Dense {
    pub fn new(inputs: usize, outputs: usize, rng: &mut StdRng) -> Self {
        let limit = glorot_limit(inputs, outputs);
        Self {
            w: Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-limit..limit)),
            b: Array1::zeros(outputs),
        }
    }

    pub fn forward(&self, x: &Array1<f32>) -> Array1<f32> {
        x.dot(&self.w) + &self.b
    }

    pub fn backward(
        &self,
        x: &Array1<f32>,
        dout: &Array1<f32>,
        grads: &mut DenseGrads,
    ) -> Array1<f32> {
        let dw = x
            .view()
            .insert_axis(Axis(1))
            .dot(&dout.view().insert_axis(Axis(0)));
        grads.w += &dw;
        grads.b += dout;
        self.w.dot(dout)
    }
}

/// Inverted dropout: the returned mask already carries the 1/(1-rate)
/// scaling, so eval-time forward is the identity.
pub fn dropout_mask<D: Dimension>(
    shape: &Array<f32, D>,
    rate: f32,
    rng: &mut StdRng,
) -> Array<f32, D> {
    let keep = 1.0 - rate;
    shape.map(|_| if rng.gen::<f32>() < rate { 0.0 } else { 1.0 / keep })
}
