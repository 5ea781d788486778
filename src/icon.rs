//! Pixel side of pixmap ingest: choosing the best-fitting size out of
//! the advertised IconPixmap tuples and converting it to the image bytes
//! the display server takes.
//!
//! Both functions are pure; the bus fetch and the pixmap upload around
//! them live in `sni` and `x11`.

/// One entry of the IconPixmap property: width, height, ARGB32 bytes in
/// network order.
pub type PixmapTuple = (i32, i32, Vec<u8>);

/// Pick the tuple whose width is closest to `icon_size`, preferring the
/// larger width on ties. Entries with non-positive dimensions or a byte
/// length other than w*h*4 never qualify.
pub fn select_pixmap(tuples: &[PixmapTuple], icon_size: u16) -> Option<&PixmapTuple> {
    let mut best: Option<&PixmapTuple> = None;
    for tuple in tuples {
        let (w, h, data) = tuple;
        if *w <= 0 || *h <= 0 || data.len() as i64 != *w as i64 * *h as i64 * 4 {
            continue;
        }
        let diff = (*w - i32::from(icon_size)).abs();
        match best {
            Some((bw, _, _)) => {
                let best_diff = (*bw - i32::from(icon_size)).abs();
                if diff < best_diff || (diff == best_diff && *w > *bw) {
                    best = Some(tuple);
                }
            }
            None => best = Some(tuple),
        }
    }
    best
}

/// Dimensions of the scaled image: sources larger than the icon square
/// are shrunk to it, smaller ones are kept as-is.
pub fn target_dims(src_w: i32, src_h: i32, icon_size: u16) -> (u16, u16) {
    let clamp = |v: i32| (v.min(i32::from(icon_size))) as u16;
    (clamp(src_w), clamp(src_h))
}

/// Nearest-neighbour resample from ARGB32 (network byte order) to the
/// BGRX layout the server-side pixmap takes. Fully transparent source
/// pixels come out as four zero bytes; everything else keeps its colour
/// with the alpha dropped.
pub fn scale_to_bgrx(src: &[u8], src_w: u16, src_h: u16, dst_w: u16, dst_h: u16) -> Vec<u8> {
    let (src_w, src_h) = (usize::from(src_w), usize::from(src_h));
    let (dst_w, dst_h) = (usize::from(dst_w), usize::from(dst_h));
    let mut out = vec![0u8; dst_w * dst_h * 4];
    for i in 0..dst_w * dst_h {
        let src_x = (i % dst_w) * src_w / dst_w;
        let src_y = (i / dst_w) * src_h / dst_h;
        let s = (src_y * src_w + src_x) * 4;
        let (a, r, g, b) = (src[s], src[s + 1], src[s + 2], src[s + 3]);
        if a != 0 {
            out[i * 4] = b;
            out[i * 4 + 1] = g;
            out[i * 4 + 2] = r;
            // fourth byte stays 0 (padding)
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(w: i32, h: i32) -> PixmapTuple {
        let len = (w.max(0) as usize) * (h.max(0) as usize) * 4;
        (w, h, vec![0xff; len])
    }

    #[test]
    fn selects_closest_width_to_icon_size() {
        let tuples = vec![tuple(16, 16), tuple(32, 32), tuple(48, 48)];
        let best = select_pixmap(&tuples, 22).unwrap();
        assert_eq!((best.0, best.1), (16, 16));
    }

    #[test]
    fn tie_prefers_larger_width() {
        // |20-22| == |24-22|
        let tuples = vec![tuple(20, 20), tuple(24, 24)];
        let best = select_pixmap(&tuples, 22).unwrap();
        assert_eq!(best.0, 24);
        let reversed = vec![tuple(24, 24), tuple(20, 20)];
        assert_eq!(select_pixmap(&reversed, 22).unwrap().0, 24);
    }

    #[test]
    fn malformed_entries_never_qualify() {
        let short = (16, 16, vec![0u8; 16 * 16 * 4 - 4]);
        let degenerate = (0, 16, vec![]);
        let negative = (-16, 16, vec![]);
        assert!(select_pixmap(&[short, degenerate, negative], 22).is_none());
    }

    #[test]
    fn malformed_entries_are_skipped_over() {
        let tuples = vec![(64, 64, vec![0u8; 7]), tuple(32, 32)];
        assert_eq!(select_pixmap(&tuples, 22).unwrap().0, 32);
    }

    #[test]
    fn target_dims_never_exceed_icon_size() {
        assert_eq!(target_dims(48, 48, 22), (22, 22));
        assert_eq!(target_dims(16, 16, 22), (16, 16));
        assert_eq!(target_dims(64, 8, 22), (22, 8));
    }

    #[test]
    fn channels_are_reordered_and_alpha_dropped() {
        // One pixel: A=0x80, R=0x11, G=0x22, B=0x33.
        let out = scale_to_bgrx(&[0x80, 0x11, 0x22, 0x33], 1, 1, 1, 1);
        assert_eq!(out, vec![0x33, 0x22, 0x11, 0x00]);
    }

    #[test]
    fn transparent_pixels_become_zero() {
        let out = scale_to_bgrx(&[0x00, 0xaa, 0xbb, 0xcc], 1, 1, 1, 1);
        assert_eq!(out, vec![0, 0, 0, 0]);
    }

    #[test]
    fn downscale_samples_nearest_neighbour() {
        // 2x2 source, four distinct opaque colours; 1x1 target picks the
        // top-left sample per the index formula.
        #[rustfmt::skip]
        let src = vec![
            0xff, 1, 1, 1,   0xff, 2, 2, 2,
            0xff, 3, 3, 3,   0xff, 4, 4, 4,
        ];
        let out = scale_to_bgrx(&src, 2, 2, 1, 1);
        assert_eq!(out, vec![1, 1, 1, 0]);
    }

    #[test]
    fn resample_is_deterministic() {
        let src: Vec<u8> = (0..16 * 16 * 4).map(|i| (i % 251) as u8).collect();
        let a = scale_to_bgrx(&src, 16, 16, 11, 11);
        let b = scale_to_bgrx(&src, 16, 16, 11, 11);
        assert_eq!(a, b);
        assert_eq!(a.len(), 11 * 11 * 4);
    }
}
