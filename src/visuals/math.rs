//! Small vector and color types for the reactive mapping

use serde::{Deserialize, Serialize};

/// Three-component vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    #[must_use]
    pub fn scale(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.z
            .mul_add(self.z, self.x.mul_add(self.x, self.y * self.y))
            .sqrt()
    }

    /// Unit vector in the same direction; the zero vector stays zero
    #[must_use]
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len > 0.0 { self.scale(1.0 / len) } else { self }
    }

    /// Move `alpha` of the way toward `target`
    #[must_use]
    pub fn lerp(self, target: Self, alpha: f32) -> Self {
        self.add(target.sub(self).scale(alpha))
    }

    /// Rotate by Euler angles applied in XYZ order
    #[must_use]
    pub fn rotate_xyz(self, euler: Self) -> Self {
        let (b, a) = euler.x.sin_cos();
        let (d, c) = euler.y.sin_cos();
        let (f, e) = euler.z.sin_cos();
        let (ae, af, be, bf) = (a * e, a * f, b * e, b * f);

        let row = |m0: f32, m1: f32, m2: f32| {
            m2.mul_add(self.z, m0.mul_add(self.x, m1 * self.y))
        };

        Self::new(
            row(c * e, -c * f, d),
            row(be.mul_add(d, af), (-bf).mul_add(d, ae), -b * c),
            row((-ae).mul_add(d, bf), af.mul_add(d, be), a * c),
        )
    }
}

/// Linear RGB color with components in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0);

    #[must_use]
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Color from a `0xRRGGBB` literal
    #[must_use]
    pub fn from_hex(hex: u32) -> Self {
        let channel = |shift: u32| f32::from(u8::try_from((hex >> shift) & 0xff).unwrap_or(0)) / 255.0;
        Self::new(channel(16), channel(8), channel(0))
    }

    /// Color from hue, saturation and lightness
    ///
    /// Hue wraps into `[0, 1)`; saturation and lightness are clamped.
    #[must_use]
    pub fn from_hsl(h: f32, s: f32, l: f32) -> Self {
        let h = h.rem_euclid(1.0);
        let s = s.clamp(0.0, 1.0);
        let l = l.clamp(0.0, 1.0);

        if s == 0.0 {
            return Self::new(l, l, l);
        }

        let p = if l <= 0.5 {
            l * (1.0 + s)
        } else {
            l.mul_add(-s, l + s)
        };
        let q = 2.0f32.mul_add(l, -p);

        Self::new(
            hue_to_rgb(q, p, h + 1.0 / 3.0),
            hue_to_rgb(q, p, h),
            hue_to_rgb(q, p, h - 1.0 / 3.0),
        )
    }

    /// Move `alpha` of the way toward `target`
    #[must_use]
    pub fn lerp(self, target: Self, alpha: f32) -> Self {
        Self::new(
            (target.r - self.r).mul_add(alpha, self.r),
            (target.g - self.g).mul_add(alpha, self.g),
            (target.b - self.b).mul_add(alpha, self.b),
        )
    }
}

fn hue_to_rgb(p: f32, q: f32, t: f32) -> f32 {
    let t = if t < 0.0 {
        t + 1.0
    } else if t > 1.0 {
        t - 1.0
    } else {
        t
    };

    if t < 1.0 / 6.0 {
        ((q - p) * 6.0).mul_add(t, p)
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        ((q - p) * 6.0).mul_add(2.0 / 3.0 - t, p)
    } else {
        p
    }
}
