// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format conversion helpers shared by the capture backends

/// Convert YUYV (YUV 4:2:2) to RGB
///
/// YUYV format: Y0 U0 Y1 V0 - each 4-byte group encodes 2 pixels.
/// Uses BT.601 coefficients for YUV to RGB conversion.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixel_count = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    for chunk in data.chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        for y in [y0, y1] {
            push_bt601(&mut rgb, y, u, v);
            if rgb.len() >= pixel_count * 3 {
                break;
            }
        }
    }

    rgb
}

/// Convert UYVY (YUV 4:2:2) to RGB
///
/// UYVY format: U0 Y0 V0 Y1 - each 4-byte group encodes 2 pixels.
pub fn uyvy_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixel_count = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    for chunk in data.chunks_exact(4) {
        let u = chunk[0] as f32 - 128.0;
        let y0 = chunk[1] as f32;
        let v = chunk[2] as f32 - 128.0;
        let y1 = chunk[3] as f32;

        for y in [y0, y1] {
            push_bt601(&mut rgb, y, u, v);
            if rgb.len() >= pixel_count * 3 {
                break;
            }
        }
    }

    rgb
}

fn push_bt601(rgb: &mut Vec<u8>, y: f32, u: f32, v: f32) {
    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    rgb.push(r);
    rgb.push(g);
    rgb.push(b);
}

/// Map a raw intensity map into 8-bit gray using a fixed range
///
/// `scale = 255 / (max - min)`, values outside the range clamp to 0/255.
/// The range is fixed per sensor class, never derived from the frame, so
/// brightness stays comparable across a pattern sequence.
pub fn intensity_to_gray8(intensity: &[f32], min: f64, max: f64) -> Vec<u8> {
    let scale = 255.0 / (max - min);
    intensity
        .iter()
        .map(|&v| ((v as f64 - min) * scale).clamp(0.0, 255.0) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_grayscale() {
        // Y=128, U=V=128 (neutral) decodes to mid gray
        let data = [128u8, 128, 128, 128];
        let rgb = yuyv_to_rgb(&data, 2, 1);
        assert_eq!(rgb.len(), 6);
        assert_eq!(&rgb[0..3], &[128, 128, 128]);
        assert_eq!(&rgb[3..6], &[128, 128, 128]);
    }

    #[test]
    fn test_uyvy_channel_order() {
        // Same samples, swapped packing; both pixels share chroma
        let yuyv = yuyv_to_rgb(&[200, 100, 50, 160], 2, 1);
        let uyvy = uyvy_to_rgb(&[100, 200, 160, 50], 2, 1);
        assert_eq!(yuyv, uyvy);
    }

    #[test]
    fn test_intensity_fixed_range() {
        let gray = intensity_to_gray8(&[0.0, 512.0, 1024.0], 0.0, 1024.0);
        assert_eq!(gray[0], 0);
        assert_eq!(gray[1], 127);
        assert_eq!(gray[2], 255);
    }

    #[test]
    fn test_intensity_clamps_outside_range() {
        let gray = intensity_to_gray8(&[-5.0, 2000.0], 0.0, 1024.0);
        assert_eq!(gray, vec![0, 255]);
    }
}
