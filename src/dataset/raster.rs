/// A row-major `height x width x channels` pixel buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Raster<T> {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<T>,
}

/// Pixel element types that can be resampled.
pub trait Pixel: Copy + Default + Send + Sync {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Pixel for u8 {
    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }
}

impl Pixel for f32 {
    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

/// How samples outside the raster are filled.
#[derive(burn::config::Config, Debug, Copy, PartialEq, Eq)]
pub enum BorderMode {
    /// `gfedcb|abcdefgh|gfedcba`
    Reflect101,
    /// Zero outside the raster.
    Constant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Bilinear,
}

/// Maps output pixel coordinates `(x, y)` to source coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine {
    pub matrix: [[f32; 3]; 2],
}

impl Affine {
    /// Inverse of: rotate by `degrees` and scale by `scale` around the
    /// raster center, then translate by `(shift_x, shift_y)` pixels.
    pub fn inverse_similarity(
        height: usize,
        width: usize,
        degrees: f32,
        scale: f32,
        shift_x: f32,
        shift_y: f32,
    ) -> Self {
        let center_x = width as f32 / 2.0 - 0.5;
        let center_y = height as f32 / 2.0 - 0.5;
        let (sin, cos) = degrees.to_radians().sin_cos();

        // src = R^-1 (dst - center - shift) / scale + center
        let a = cos / scale;
        let b = sin / scale;
        let offset_x = center_x + shift_x;
        let offset_y = center_y + shift_y;

        Affine {
            matrix: [
                [a, b, center_x - a * offset_x - b * offset_y],
                [-b, a, center_y + b * offset_x - a * offset_y],
            ],
        }
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [row_x, row_y] = self.matrix;
        (
            row_x[0] * x + row_x[1] * y + row_x[2],
            row_y[0] * x + row_y[1] * y + row_y[2],
        )
    }
}

fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let index = index.rem_euclid(period);
    if index >= len as isize {
        (period - index) as usize
    } else {
        index as usize
    }
}

impl<T: Pixel> Raster<T> {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<T>) -> Option<Self> {
        (data.len() == height * width * channels).then_some(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub fn filled(height: usize, width: usize, channels: usize, value: T) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![value; height * width * channels],
        }
    }

    pub fn get(&self, y: usize, x: usize, c: usize) -> T {
        self.data[(y * self.width + x) * self.channels + c]
    }

    fn sample(&self, y: isize, x: isize, c: usize, border: BorderMode) -> f32 {
        let inside = (0..self.height as isize).contains(&y) && (0..self.width as isize).contains(&x);
        match (inside, border) {
            (true, _) => self.get(y as usize, x as usize, c).to_f32(),
            (false, BorderMode::Constant) => 0.0,
            (false, BorderMode::Reflect101) => self
                .get(reflect_101(y, self.height), reflect_101(x, self.width), c)
                .to_f32(),
        }
    }

    pub fn flip_horizontal(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for y in 0..self.height {
            for x in (0..self.width).rev() {
                let start = (y * self.width + x) * self.channels;
                data.extend_from_slice(&self.data[start..start + self.channels]);
            }
        }
        Self { data, ..*self }
    }

    pub fn flip_vertical(&self) -> Self {
        let row = self.width * self.channels;
        let data = self
            .data
            .chunks_exact(row.max(1))
            .rev()
            .flatten()
            .copied()
            .collect();
        Self { data, ..*self }
    }

    /// Resamples through `inverse`, which maps output to source coordinates.
    pub fn warp(&self, inverse: &Affine, border: BorderMode, interpolation: Interpolation) -> Self {
        let mut data = Vec::with_capacity(self.data.len());

        for y in 0..self.height {
            for x in 0..self.width {
                let (src_x, src_y) = inverse.apply(x as f32, y as f32);

                match interpolation {
                    Interpolation::Nearest => {
                        let (sx, sy) = (src_x.round() as isize, src_y.round() as isize);
                        for c in 0..self.channels {
                            data.push(T::from_f32(self.sample(sy, sx, c, border)));
                        }
                    }
                    Interpolation::Bilinear => {
                        let (x0, y0) = (src_x.floor(), src_y.floor());
                        let (fx, fy) = (src_x - x0, src_y - y0);
                        let (x0, y0) = (x0 as isize, y0 as isize);

                        for c in 0..self.channels {
                            let top = self.sample(y0, x0, c, border) * (1.0 - fx)
                                + self.sample(y0, x0 + 1, c, border) * fx;
                            let bottom = self.sample(y0 + 1, x0, c, border) * (1.0 - fx)
                                + self.sample(y0 + 1, x0 + 1, c, border) * fx;
                            data.push(T::from_f32(top * (1.0 - fy) + bottom * fy));
                        }
                    }
                }
            }
        }

        Self { data, ..*self }
    }

    /// Planar `channels x height x width` copy of the data.
    pub fn to_chw(&self) -> Vec<f32> {
        let plane = self.height * self.width;
        let mut out = vec![0.0; self.data.len()];
        for (i, value) in self.data.iter().enumerate() {
            let (pixel, c) = (i / self.channels, i % self.channels);
            out[c * plane + pixel] = value.to_f32();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Raster<u8> {
        // 2 x 3, one channel: 0 1 2 / 3 4 5
        Raster::new(2, 3, 1, (0..6).collect()).unwrap()
    }

    #[test]
    fn flips() {
        assert_eq!(ramp().flip_horizontal().data, vec![2, 1, 0, 5, 4, 3]);
        assert_eq!(ramp().flip_vertical().data, vec![3, 4, 5, 0, 1, 2]);
    }

    #[test]
    fn reflect_101_skips_the_edge() {
        let indices: Vec<usize> = (-3..6).map(|i| reflect_101(i, 3)).collect();
        assert_eq!(indices, vec![1, 2, 1, 0, 1, 2, 1, 0, 1]);
    }

    #[test]
    fn identity_warp_is_lossless() {
        let identity = Affine::inverse_similarity(2, 3, 0.0, 1.0, 0.0, 0.0);
        for interpolation in [Interpolation::Nearest, Interpolation::Bilinear] {
            assert_eq!(ramp().warp(&identity, BorderMode::Constant, interpolation), ramp());
        }
    }

    #[test]
    fn half_turn_matches_double_flip() {
        let image = Raster::new(3, 3, 1, (0..9).collect::<Vec<u8>>()).unwrap();
        let half_turn = Affine::inverse_similarity(3, 3, 180.0, 1.0, 0.0, 0.0);

        assert_eq!(
            image.warp(&half_turn, BorderMode::Constant, Interpolation::Nearest),
            image.flip_horizontal().flip_vertical()
        );
    }

    #[test]
    fn constant_border_fills_zero() {
        let image = Raster::filled(2, 2, 1, 9.0f32);
        let shift = Affine::inverse_similarity(2, 2, 0.0, 1.0, 1.0, 0.0);
        let shifted = image.warp(&shift, BorderMode::Constant, Interpolation::Nearest);

        assert_eq!(shifted.data, vec![0.0, 9.0, 0.0, 9.0]);
    }

    #[test]
    fn chw_layout() {
        let image = Raster::new(1, 2, 2, vec![1u8, 2, 3, 4]).unwrap();
        assert_eq!(image.to_chw(), vec![1.0, 3.0, 2.0, 4.0]);
    }
}
