//! Minimal Well-Known Binary writer for the two geometry shapes the
//! spatial backends ever emit: a single-ring polygon and a multipolygon
//! of single-ring polygons (spec §6 "Persisted spatial filter format" —
//! "Well-Known Binary geometry plus a positive integer SRID... must
//! survive a round-trip through `ST_AsBinary`").
//!
//! Hand-rolled rather than pulled from a crate: the ISO WKB layout for
//! these two shapes is a few dozen bytes of struct-packing, and every
//! PostGIS-facing write in this crate only ever needs polygons without
//! interior rings.

/// Little-endian byte order marker used throughout (`1` in the WKB spec).
const NDR: u8 = 1;

const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;

fn push_ring(buf: &mut Vec<u8>, ring: &[(f64, f64)]) {
    buf.extend_from_slice(&(ring.len() as u32).to_le_bytes());
    for (x, y) in ring {
        buf.extend_from_slice(&x.to_le_bytes());
        buf.extend_from_slice(&y.to_le_bytes());
    }
}

/// Encode a single exterior ring (no holes) as a WKB `POLYGON`. `ring`
/// must already be closed (first point == last point); callers that
/// build rings from a rectangle or a cell boundary are responsible for
/// that.
pub fn polygon(ring: &[(f64, f64)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + 4 + ring.len() * 16);
    buf.push(NDR);
    buf.extend_from_slice(&WKB_POLYGON.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes()); // one ring, no holes
    push_ring(&mut buf, ring);
    buf
}

/// Encode a set of exterior rings as a WKB `MULTIPOLYGON`, one polygon
/// per ring. Used for the union of dilated envelopes/cell boundaries:
/// the rings are left unmerged (possibly overlapping), which is a safe
/// superset for `ST_DWithin` containment purposes even where a true
/// boolean union would produce fewer, larger rings.
pub fn multipolygon(rings: &[Vec<(f64, f64)>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + rings.iter().map(|r| 9 + 4 + r.len() * 16).sum::<usize>());
    buf.push(NDR);
    buf.extend_from_slice(&WKB_MULTIPOLYGON.to_le_bytes());
    buf.extend_from_slice(&(rings.len() as u32).to_le_bytes());
    for ring in rings {
        buf.push(NDR);
        buf.extend_from_slice(&WKB_POLYGON.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        push_ring(&mut buf, ring);
    }
    buf
}

/// A closed axis-aligned rectangle ring, dilated outward by `pad` on
/// every side, in the order WKB expects (counter-clockwise, closed).
pub fn dilated_rect_ring(min_x: f64, min_y: f64, max_x: f64, max_y: f64, pad: f64) -> Vec<(f64, f64)> {
    let (min_x, min_y, max_x, max_y) = (min_x - pad, min_y - pad, max_x + pad, max_y + pad);
    vec![
        (min_x, min_y),
        (max_x, min_y),
        (max_x, max_y),
        (min_x, max_y),
        (min_x, min_y),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_header_matches_wkb_layout() {
        let ring = dilated_rect_ring(0.0, 0.0, 1.0, 1.0, 0.0);
        let bytes = polygon(&ring);
        assert_eq!(bytes[0], NDR);
        assert_eq!(u32::from_le_bytes(bytes[1..5].try_into().unwrap()), WKB_POLYGON);
        assert_eq!(u32::from_le_bytes(bytes[5..9].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[9..13].try_into().unwrap()), 5);
    }

    #[test]
    fn dilation_expands_every_side() {
        let ring = dilated_rect_ring(1.0, 1.0, 2.0, 2.0, 0.5);
        assert_eq!(ring[0], (0.5, 0.5));
        assert_eq!(ring[2], (2.5, 2.5));
    }

    #[test]
    fn multipolygon_counts_match_ring_count() {
        let rings = vec![
            dilated_rect_ring(0.0, 0.0, 1.0, 1.0, 0.0),
            dilated_rect_ring(5.0, 5.0, 6.0, 6.0, 0.0),
        ];
        let bytes = multipolygon(&rings);
        assert_eq!(u32::from_le_bytes(bytes[5..9].try_into().unwrap()), 2);
    }
}
