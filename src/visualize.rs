//! Preview panels and intermediate-layer activation maps.
//!
//! Everything here returns arrays first; turning them into an [`RgbImage`] is a
//! separate step so callers can plot them however they like.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::prelude::*;

use crate::codec::to_rgb_image;
use crate::errors::{HempSegError, Result};
use crate::sample::Sample;
use crate::traits::ActivationSource;

/// Mask channel left out of overlays.
pub const OVERLAY_ZERO_CHANNEL: usize = 2;
pub const PREVIEW_OVERLAY_WEIGHT: f32 = 0.5;
pub const ACTIVATION_OVERLAY_WEIGHT: f32 = 0.3;
/// Number of channels kept per layer.
pub const ACTIVATION_WINDOW: usize = 4;
const ACTIVATION_BLUR_SIGMA: f32 = 0.1;

/// `image + weight * mask`, clipped to `[0, 1]`, with one mask channel zeroed.
pub fn overlay(
    image: ArrayView3<f32>,
    mask: ArrayView3<f32>,
    zero_channel: Option<usize>,
    weight: f32,
) -> Result<Array3<f32>> {
    if image.dim() != mask.dim() {
        return Err(HempSegError::validation(
            "mask",
            format!(
                "overlay needs matching shapes, got image {:?} and mask {:?}",
                image.shape(),
                mask.shape()
            ),
        ));
    }
    let mut mask = mask.to_owned();
    if let Some(channel) = zero_channel.filter(|&c| c < mask.dim().2) {
        mask.index_axis_mut(Axis(2), channel).fill(0.0);
    }
    let mut out = image.to_owned();
    out.zip_mut_with(&mask, |o, &m| *o = (*o + weight * m).clamp(0.0, 1.0));
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub title: String,
    /// `[H, W, 3]` in `[0, 1]`.
    pub data: Array3<f32>,
}

impl Panel {
    fn new(title: &str, data: Array3<f32>) -> Self {
        Self {
            title: title.to_string(),
            data,
        }
    }
}

/// Image, mask and a third panel: the thresholded `prediction` when given,
/// otherwise the mask overlaid on the image.
pub fn preview(
    sample: &Sample,
    prediction: Option<ArrayView3<f32>>,
    threshold: f32,
) -> Result<Vec<Panel>> {
    let third = match prediction {
        Some(prediction) => {
            if prediction.dim() != sample.mask.dim() {
                return Err(HempSegError::validation(
                    "prediction",
                    format!(
                        "shape {:?} differs from mask {:?}",
                        prediction.shape(),
                        sample.mask.shape()
                    ),
                ));
            }
            Panel::new(
                "prediction",
                prediction.mapv(|v| if v > threshold { 1.0 } else { 0.0 }),
            )
        }
        None => Panel::new(
            "overlay",
            overlay(
                sample.image.view(),
                sample.mask.view(),
                Some(OVERLAY_ZERO_CHANNEL),
                PREVIEW_OVERLAY_WEIGHT,
            )?,
        ),
    };
    Ok(vec![
        Panel::new("image", sample.image.clone()),
        Panel::new("mask", sample.mask.clone()),
        third,
    ])
}

/// Tiles panels left to right.
pub fn render_panels(panels: &[Panel]) -> Result<RgbImage> {
    let tiles = panels
        .iter()
        .map(|p| to_rgb_image(p.data.view()))
        .collect::<Result<Vec<_>>>()?;
    let width = tiles.iter().map(RgbImage::width).sum();
    let height = tiles.iter().map(RgbImage::height).max().unwrap_or(0);
    let mut canvas = RgbImage::new(width, height);
    let mut x = 0i64;
    for tile in &tiles {
        imageops::replace(&mut canvas, tile, x, 0);
        x += i64::from(tile.width());
    }
    Ok(canvas)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRow {
    pub layer: String,
    /// Channel indices shown, lowest standard deviation first.
    pub channels: Vec<usize>,
    /// Blurred activation of each listed channel, `[h, w]`.
    pub maps: Vec<Array2<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivationReport {
    /// Input image with the mask overlaid.
    pub overlay: Array3<f32>,
    pub rows: Vec<ActivationRow>,
}

/// Picks `ACTIVATION_WINDOW` channels by spatial standard deviation.
///
/// Channels are ranked ascending; the window ends `shift` places below the top.
fn select_channels(activation: ArrayView3<f32>, shift: usize) -> Result<Vec<usize>> {
    let count = activation.dim().0;
    if shift >= count {
        return Err(HempSegError::validation(
            "shift",
            format!("{shift} leaves no channels out of {count}"),
        ));
    }
    let stds: Vec<f32> = activation.outer_iter().map(|c| c.std(0.0)).collect();
    let mut ranked: Vec<usize> = (0..count).collect();
    ranked.sort_by(|&a, &b| stds[a].total_cmp(&stds[b]));

    let end = count - shift;
    let start = end.saturating_sub(ACTIVATION_WINDOW);
    Ok(ranked[start..end].to_vec())
}

fn blur(map: ArrayView2<f32>) -> Result<Array2<f32>> {
    let (h, w) = map.dim();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(w as u32, h as u32, map.iter().copied().collect()).ok_or_else(
            || HempSegError::validation("activation", format!("cannot view {h}x{w} map as image")),
        )?;
    let blurred = imageops::blur(&buffer, ACTIVATION_BLUR_SIGMA);
    Ok(Array2::from_shape_vec((h, w), blurred.into_raw())?)
}

/// Runs `image` through `source` up to each of `layers` and collects the most
/// varied channels of each.
pub fn activation_maps<S: ActivationSource + ?Sized>(
    source: &S,
    image: ArrayView3<f32>,
    mask: ArrayView3<f32>,
    layers: &[&str],
    shift: usize,
) -> Result<ActivationReport> {
    let overlay = overlay(
        image,
        mask,
        Some(OVERLAY_ZERO_CHANNEL),
        ACTIVATION_OVERLAY_WEIGHT,
    )?;
    let input = image.permuted_axes([2, 0, 1]).insert_axis(Axis(0));

    let rows = layers
        .iter()
        .map(|&layer| {
            let activation = source.layer_activation(input.view(), layer)?;
            let activation = activation.index_axis(Axis(0), 0);
            let channels = select_channels(activation, shift)?;
            let maps = channels
                .iter()
                .map(|&c| blur(activation.index_axis(Axis(0), c)))
                .collect::<Result<Vec<_>>>()?;
            Ok(ActivationRow {
                layer: layer.to_string(),
                channels,
                maps,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ActivationReport { overlay, rows })
}

/// Classic jet colour map for a value in `[0, 1]`.
fn jet(v: f32) -> Rgb<u8> {
    let channel = |offset: f32| {
        let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

fn colorize(map: &Array2<f32>, width: u32, height: u32) -> RgbImage {
    let (lo, hi) = map
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = if hi > lo { hi - lo } else { 1.0 };
    let (h, w) = map.dim();
    let small = RgbImage::from_fn(w as u32, h as u32, |x, y| {
        jet((map[[y as usize, x as usize]] - lo) / range)
    });
    imageops::resize(&small, width, height, FilterType::Nearest)
}

/// One row per layer: the first three maps of its window, then the overlay.
pub fn render_activation_grid(report: &ActivationReport) -> Result<RgbImage> {
    const MAPS_PER_ROW: u32 = 3;

    let overlay = to_rgb_image(report.overlay.view())?;
    let (cell_w, cell_h) = overlay.dimensions();
    let rows = report.rows.len() as u32;
    let mut canvas = RgbImage::new(cell_w * (MAPS_PER_ROW + 1), cell_h * rows);

    for (r, row) in report.rows.iter().enumerate() {
        let y = i64::from(cell_h) * r as i64;
        for (c, map) in row.maps.iter().take(MAPS_PER_ROW as usize).enumerate() {
            let tile = colorize(map, cell_w, cell_h);
            imageops::replace(&mut canvas, &tile, i64::from(cell_w) * c as i64, y);
        }
        imageops::replace(&mut canvas, &overlay, i64::from(cell_w * MAPS_PER_ROW), y);
    }
    Ok(canvas)
}
