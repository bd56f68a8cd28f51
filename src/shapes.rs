// Shape library - deterministic per-mode point layouts and palette rules
use anyhow::Result;
use glam::Vec3;
use image::GrayImage;
use rand::Rng;
use std::f32::consts::PI;

use crate::types::{GroupRole, Mode, Rgb};

pub const TREE_HEIGHT: f32 = 10.0;
pub const TREE_RADIUS: f32 = 4.0;
const TREE_APEX_COUNT: usize = 50;

const HEART_SCALE: f32 = 0.3;
const HEART_LIFT: f32 = 2.0;
const HEART_DEPTH: f32 = 4.0;

const SATURN_BODY_RADIUS: f32 = 2.5;
const SATURN_RING_INNER: f32 = 3.5;
const SATURN_RING_SPAN: f32 = 2.5;
const SATURN_RING_TILT: f32 = 0.4;

const FLOWER_PETALS: f32 = 5.0;
const FLOWER_RADIUS: f32 = 5.0;
const FLOWER_TILT: f32 = 0.5;

const RIBBON_RADIUS: f32 = 3.2;
const RIBBON_WIDTH: f32 = 0.4;
const RIBBON_TILT_DEG: f32 = 25.0;

const SCATTER_RADIUS_MAIN: f32 = 10.0;
const SCATTER_RADIUS_RIBBON: f32 = 20.0;
const SPHERE_RADIUS: f32 = 5.0;
pub const AMBIENT_EXTENT: f32 = 20.0;

// Glyph raster constants: pixels brighter than the threshold count as part
// of the text; the world height the rasterized text is scaled to.
const GLYPH_THRESHOLD: u8 = 50;
const GLYPH_PIXEL_SCALE: u32 = 16;
const GLYPH_WORLD_HEIGHT: f32 = 5.5;
const GLYPH_JITTER_XY: f32 = 0.04;
const GLYPH_JITTER_Z: f32 = 0.25;

/// How the tree mode lays out the main group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStyle {
    /// Rasterized text sampled pixel-by-pixel.
    Glyph,
    /// Volumetric cone with trunk and apex cluster.
    Cone,
}

impl TreeStyle {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "glyph" | "text" => Some(TreeStyle::Glyph),
            "cone" | "volumetric" => Some(TreeStyle::Cone),
            _ => None,
        }
    }
}

/// Deployment-level knobs the generators honor. Built once from config.
#[derive(Debug, Clone)]
pub struct ShapeParams {
    pub tree_style: TreeStyle,
    pub glyph_text: String,
    pub heart_outline: bool,
}

impl Default for ShapeParams {
    fn default() -> Self {
        ShapeParams {
            tree_style: TreeStyle::Glyph,
            glyph_text: "20 26".to_string(),
            heart_outline: false,
        }
    }
}

/// Immutable position+color data a particle group blends toward. Both
/// sequences are always exactly `count` long; the only constructor enforces
/// it.
pub struct ShapeTarget {
    positions: Vec<Vec3>,
    colors: Vec<Rgb>,
}

impl ShapeTarget {
    fn new(positions: Vec<Vec3>, colors: Vec<Rgb>) -> Self {
        assert_eq!(positions.len(), colors.len());
        ShapeTarget { positions, colors }
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }
}

/// Generate the target layout for one (mode, role, count) triple.
///
/// `count == 0` is a programming error and fails fast. Everything else is
/// pure arithmetic and cannot fail at runtime, apart from the glyph raster
/// path which falls back to the cone layout when no pixel survives the
/// luminance threshold.
pub fn generate(mode: Mode, role: GroupRole, count: usize, params: &ShapeParams) -> Result<ShapeTarget> {
    if count == 0 {
        anyhow::bail!("shape generation requires count > 0 (got {})", count);
    }

    let target = match role {
        GroupRole::Main => match mode {
            Mode::Tree => tree(count, params),
            Mode::Heart => heart(count, params.heart_outline),
            Mode::Scatter => scatter(count, SCATTER_RADIUS_MAIN),
            Mode::Saturn => saturn(count),
            Mode::Flower => flower(count),
            Mode::Dna => double_ring(count, RIBBON_RADIUS, RIBBON_WIDTH * 2.0, dna_color),
            Mode::Sphere => sphere_surface(count, SPHERE_RADIUS),
        },
        // The ribbon winds through the tree; in every other mode it backs
        // off into background dust so it doesn't fight the main shape.
        GroupRole::Ribbon => match mode {
            Mode::Tree | Mode::Dna => double_ring(count, RIBBON_RADIUS, RIBBON_WIDTH, |_, rng| silver_color(rng)),
            Mode::Heart | Mode::Scatter | Mode::Saturn | Mode::Flower | Mode::Sphere => {
                dust(count, SCATTER_RADIUS_RIBBON)
            }
        },
        // Ambient drift is mode-independent.
        GroupRole::Ambient => ambient(count),
    };

    debug_assert_eq!(target.count(), count);
    Ok(target)
}

// Structural partition helpers. These are exact index splits, independent of
// any randomness, so role fractions hold for every count.

pub fn saturn_body_count(count: usize) -> usize {
    (count as f64 * 0.6) as usize
}

pub fn flower_stamen_count(count: usize) -> usize {
    (count as f64 * 0.2) as usize
}

pub fn tree_cone_counts(count: usize) -> (usize, usize, usize) {
    let apex = TREE_APEX_COUNT.min(count / 10);
    let trunk = count / 10;
    let canopy = count - trunk - apex;
    (canopy, trunk, apex)
}

fn rotate_x(v: Vec3, angle: f32) -> Vec3 {
    let (sin, cos) = angle.sin_cos();
    Vec3::new(v.x, v.y * cos - v.z * sin, v.y * sin + v.z * cos)
}

/// Uniform volumetric sphere sample; cube-root radius scaling keeps the
/// density constant.
fn sample_in_sphere(rng: &mut impl Rng, radius: f32) -> Vec3 {
    let r = radius * rng.gen::<f32>().cbrt();
    let theta = rng.gen::<f32>() * PI * 2.0;
    let phi = (2.0 * rng.gen::<f32>() - 1.0).acos();
    Vec3::new(
        r * phi.sin() * theta.cos(),
        r * phi.sin() * theta.sin(),
        r * phi.cos(),
    )
}

fn sample_on_sphere(rng: &mut impl Rng, radius: f32) -> Vec3 {
    let theta = rng.gen::<f32>() * PI * 2.0;
    let phi = (2.0 * rng.gen::<f32>() - 1.0).acos();
    Vec3::new(
        radius * phi.sin() * theta.cos(),
        radius * phi.sin() * theta.sin(),
        radius * phi.cos(),
    )
}

/// Festive palette: mostly red, some orange-red, some gold, with bounded
/// lightness jitter so the field doesn't look flat.
fn festive_color(rng: &mut impl Rng) -> Rgb {
    let pick = rng.gen::<f32>();
    let base = if pick > 0.8 {
        Rgb::new(1.0, 0.843, 0.0) // gold
    } else if pick > 0.6 {
        Rgb::new(1.0, 0.27, 0.0) // orange-red
    } else {
        Rgb::new(1.0, 0.0, 0.0)
    };
    base.offset_lightness((rng.gen::<f32>() - 0.5) * 0.1)
}

fn silver_color(rng: &mut impl Rng) -> Rgb {
    if rng.gen::<f32>() > 0.8 {
        Rgb::WHITE
    } else {
        Rgb::from_hsl(0.61, 0.05, 0.85 + rng.gen::<f32>() * 0.1)
    }
}

fn dna_color(ring: usize, rng: &mut impl Rng) -> Rgb {
    let base = if ring == 0 {
        Rgb::from_hsl(0.5, 0.85, 0.55) // cyan strand
    } else {
        Rgb::from_hsl(0.85, 0.85, 0.6) // magenta strand
    };
    base.offset_lightness((rng.gen::<f32>() - 0.5) * 0.1)
}

fn tree(count: usize, params: &ShapeParams) -> ShapeTarget {
    match params.tree_style {
        TreeStyle::Cone => tree_cone(count),
        TreeStyle::Glyph => match tree_glyph(count, &params.glyph_text) {
            Some(target) => target,
            None => {
                eprintln!(
                    "glyph raster for {:?} produced no pixels, falling back to cone layout",
                    params.glyph_text
                );
                tree_cone(count)
            }
        },
    }
}

/// Volumetric cone: each particle independently sampled from a
/// tapered-radius disc per height slice. ~90% canopy, ~10% trunk, small
/// fixed apex cluster.
fn tree_cone(count: usize) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    let (canopy, trunk, _apex) = tree_cone_counts(count);

    for i in 0..count {
        if i < canopy {
            // Height-biased toward the base so the cone fills evenly.
            let h = rng.gen::<f32>().sqrt() * TREE_HEIGHT;
            let max_r = TREE_RADIUS * (1.0 - h / TREE_HEIGHT);
            let r = max_r * rng.gen::<f32>().sqrt();
            let a = rng.gen::<f32>() * PI * 2.0;
            positions.push(Vec3::new(r * a.cos(), h - TREE_HEIGHT * 0.5, r * a.sin()));
            colors.push(
                Rgb::from_hsl(0.33 + rng.gen::<f32>() * 0.05, 0.7, 0.3 + rng.gen::<f32>() * 0.15)
            );
        } else if i < canopy + trunk {
            let h = rng.gen::<f32>() * TREE_HEIGHT * 0.25;
            let r = 0.35 * rng.gen::<f32>().sqrt();
            let a = rng.gen::<f32>() * PI * 2.0;
            positions.push(Vec3::new(
                r * a.cos(),
                -TREE_HEIGHT * 0.5 - h,
                r * a.sin(),
            ));
            colors.push(Rgb::from_hsl(0.08, 0.5, 0.2 + rng.gen::<f32>() * 0.08));
        } else {
            // Apex cluster: a tight gold star at the tip.
            let p = sample_in_sphere(&mut rng, 0.4);
            positions.push(p + Vec3::new(0.0, TREE_HEIGHT * 0.5 + 0.3, 0.0));
            colors.push(Rgb::new(1.0, 0.843, 0.0).offset_lightness(rng.gen::<f32>() * 0.1));
        }
    }

    ShapeTarget::new(positions, colors)
}

// 5x7 bitmap glyphs, row-major, 5 bits per row. Enough for the year text
// the glyph layout renders; unsupported characters are skipped.
fn glyph_rows(c: char) -> Option<[u8; 7]> {
    let rows = match c {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        _ => return None,
    };
    Some(rows)
}

/// Render the text into an offscreen monochrome bitmap. Whitespace splits
/// lines. Returns None when no supported character is present.
fn rasterize_text(text: &str, scale: u32) -> Option<GrayImage> {
    let lines: Vec<&str> = text.split_whitespace().collect();
    if lines.is_empty() {
        return None;
    }

    let cols = lines.iter().map(|l| l.chars().count()).max()?;
    if cols == 0 {
        return None;
    }

    // 6x8 cell per glyph leaves one blank row/column of spacing.
    let width = (cols * 6) as u32 * scale;
    let height = (lines.len() * 8) as u32 * scale;
    let mut img = GrayImage::new(width, height);

    let mut any = false;
    for (line_idx, line) in lines.iter().enumerate() {
        for (char_idx, c) in line.chars().enumerate() {
            let Some(rows) = glyph_rows(c) else { continue };
            any = true;
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..5u32 {
                    if bits & (1 << (4 - col)) == 0 {
                        continue;
                    }
                    let x0 = (char_idx as u32 * 6 + col) * scale;
                    let y0 = (line_idx as u32 * 8 + row as u32) * scale;
                    for dy in 0..scale {
                        for dx in 0..scale {
                            img.put_pixel(x0 + dx, y0 + dy, image::Luma([255u8]));
                        }
                    }
                }
            }
        }
    }

    if any {
        Some(img)
    } else {
        None
    }
}

/// Glyph regime: assign each particle a uniformly-sampled-with-replacement
/// bright pixel plus small isotropic jitter, scaled into world units.
/// Returns None when rasterization yields zero valid pixels.
fn tree_glyph(count: usize, text: &str) -> Option<ShapeTarget> {
    let img = rasterize_text(text, GLYPH_PIXEL_SCALE)?;
    let (width, height) = img.dimensions();

    let mut valid = Vec::new();
    for (x, y, pixel) in img.enumerate_pixels() {
        if pixel.0[0] > GLYPH_THRESHOLD {
            valid.push((
                x as f32 - width as f32 * 0.5,
                height as f32 * 0.5 - y as f32,
            ));
        }
    }
    if valid.is_empty() {
        return None;
    }

    let world_scale = GLYPH_WORLD_HEIGHT / height as f32;
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);

    for _ in 0..count {
        let (px, py) = valid[rng.gen_range(0..valid.len())];
        positions.push(Vec3::new(
            px * world_scale + (rng.gen::<f32>() - 0.5) * GLYPH_JITTER_XY * 2.0,
            py * world_scale + (rng.gen::<f32>() - 0.5) * GLYPH_JITTER_XY * 2.0,
            (rng.gen::<f32>() - 0.5) * GLYPH_JITTER_Z * 2.0,
        ));
        colors.push(festive_color(&mut rng));
    }

    Some(ShapeTarget::new(positions, colors))
}

/// Classic parametric heart curve, optionally filled by a sqrt(random)
/// radial falloff toward the origin.
fn heart(count: usize, outline: bool) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);

    for i in 0..count {
        let t = rng.gen::<f32>() * PI * 2.0;
        let x = 16.0 * t.sin().powi(3);
        let y = 13.0 * t.cos()
            - 5.0 * (2.0 * t).cos()
            - 2.0 * (3.0 * t).cos()
            - (4.0 * t).cos();
        let z = (rng.gen::<f32>() - 0.5) * HEART_DEPTH;
        let falloff = if outline { 1.0 } else { rng.gen::<f32>().sqrt() };

        positions.push(Vec3::new(
            x * HEART_SCALE * falloff,
            y * HEART_SCALE * falloff + HEART_LIFT,
            z,
        ));

        // Pink body with a handful of gold sparks at the front of the buffer.
        let c = if i < 50 {
            Rgb::new(1.0, 0.843, 0.0)
        } else if rng.gen::<f32>() > 0.5 {
            Rgb::new(1.0, 0.0, 0.4)
        } else {
            Rgb::new(1.0, 0.8, 0.8)
        };
        colors.push(c);
    }

    ShapeTarget::new(positions, colors)
}

/// 60% solid planet body, 40% thin tilted ring annulus. The split is an
/// exact index partition.
fn saturn(count: usize) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    let body = saturn_body_count(count);

    for i in 0..count {
        if i < body {
            positions.push(sample_in_sphere(&mut rng, SATURN_BODY_RADIUS));
            colors.push(Rgb::from_hsl(0.08 + rng.gen::<f32>() * 0.05, 0.8, 0.5));
        } else {
            let angle = rng.gen::<f32>() * PI * 2.0;
            let dist = SATURN_RING_INNER + rng.gen::<f32>() * SATURN_RING_SPAN;
            let flat = Vec3::new(
                angle.cos() * dist,
                (rng.gen::<f32>() - 0.5) * 0.1,
                angle.sin() * dist,
            );
            positions.push(rotate_x(flat, SATURN_RING_TILT));
            colors.push(if rng.gen::<f32>() > 0.5 {
                Rgb::new(1.0, 0.843, 0.0)
            } else {
                Rgb::new(0.63, 0.63, 0.63)
            });
        }
    }

    ShapeTarget::new(positions, colors)
}

/// Small stamen sphere plus a k-lobed rose-curve petal field, cupped upward
/// and tilted to face the camera.
fn flower(count: usize) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    let stamen = flower_stamen_count(count);

    for i in 0..count {
        if i < stamen {
            positions.push(sample_in_sphere(&mut rng, 1.0));
            colors.push(Rgb::new(1.0, 0.667, 0.0));
        } else {
            let t = rng.gen::<f32>() * PI * 2.0;
            let lobe = (FLOWER_PETALS * t / 2.0).cos().abs();
            let r = (1.0 + (FLOWER_RADIUS - 1.0) * lobe) * rng.gen::<f32>().sqrt();
            let cup = r * 0.4;
            let flat = Vec3::new(
                r * t.cos(),
                cup + (rng.gen::<f32>() - 0.5) * 0.5,
                r * t.sin(),
            );
            positions.push(rotate_x(flat, FLOWER_TILT));
            colors.push(Rgb::from_hsl(0.8 + rng.gen::<f32>() * 0.1, 0.8, 0.6));
        }
    }

    ShapeTarget::new(positions, colors)
}

/// Two counter-tilted Möbius-strip rings, split evenly by index range.
/// Used by the dna mode and by the ribbon group in tree mode.
fn double_ring(
    count: usize,
    radius: f32,
    width: f32,
    color: impl Fn(usize, &mut rand::rngs::ThreadRng) -> Rgb,
) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    let half = count / 2;
    let tilt = RIBBON_TILT_DEG.to_radians();

    for i in 0..count {
        let ring = usize::from(i >= half);
        let ring_count = if ring == 0 { half.max(1) } else { (count - half).max(1) };
        let ring_index = if ring == 0 { i } else { i - half };

        let u = ring_index as f32 / ring_count as f32 * PI * 2.0;
        let v = (rng.gen::<f32>() - 0.5) * width;

        let p = Vec3::new(
            (radius + v * (u / 2.0).cos()) * u.cos(),
            v * (u / 2.0).sin(),
            (radius + v * (u / 2.0).cos()) * u.sin(),
        );
        let ring_tilt = if ring == 0 { tilt } else { -tilt };
        positions.push(rotate_x(p, ring_tilt));
        colors.push(color(ring, &mut rng));
    }

    ShapeTarget::new(positions, colors)
}

/// Uniform random point-in-sphere scatter, festive palette (the cloud keeps
/// its warm colors while dispersed).
fn scatter(count: usize, radius: f32) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    for _ in 0..count {
        positions.push(sample_in_sphere(&mut rng, radius));
        colors.push(festive_color(&mut rng));
    }
    ShapeTarget::new(positions, colors)
}

/// Ribbon fallback: wide silver dust sphere.
fn dust(count: usize, radius: f32) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    for _ in 0..count {
        positions.push(sample_in_sphere(&mut rng, radius));
        colors.push(silver_color(&mut rng));
    }
    ShapeTarget::new(positions, colors)
}

/// On-surface sphere shell, shaded by latitude through a cool gradient.
fn sphere_surface(count: usize, radius: f32) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let gradient = colorgrad::CustomGradient::new()
        .colors(&[
            colorgrad::Color::from_rgba8(24, 90, 219, 255),
            colorgrad::Color::from_rgba8(64, 200, 255, 255),
            colorgrad::Color::from_rgba8(235, 245, 255, 255),
        ])
        .build()
        .ok();

    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    for _ in 0..count {
        let p = sample_on_sphere(&mut rng, radius);
        let t = ((p.y / radius) + 1.0) / 2.0;
        positions.push(p);
        colors.push(match &gradient {
            Some(g) => {
                let rgba = g.at(t as f64).to_rgba8();
                Rgb::new(
                    rgba[0] as f32 / 255.0,
                    rgba[1] as f32 / 255.0,
                    rgba[2] as f32 / 255.0,
                )
            }
            None => Rgb::from_hsl(0.58, 0.7, 0.35 + t * 0.5),
        });
    }
    ShapeTarget::new(positions, colors)
}

/// Ambient snow field: a uniform cube of dim white points. The drift itself
/// is applied by the morph engine, not baked into the target.
fn ambient(count: usize) -> ShapeTarget {
    let mut rng = rand::thread_rng();
    let side = AMBIENT_EXTENT * 2.0;
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count);
    for _ in 0..count {
        positions.push(Vec3::new(
            (rng.gen::<f32>() - 0.5) * side,
            (rng.gen::<f32>() - 0.5) * side,
            (rng.gen::<f32>() - 0.5) * side,
        ));
        let l = 0.75 + rng.gen::<f32>() * 0.25;
        colors.push(Rgb::new(l, l, l));
    }
    ShapeTarget::new(positions, colors)
}
