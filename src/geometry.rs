// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Geometry serialization for both protocol modes.
//!
//! The two wire formats encode geometry differently, and the difference is
//! load-bearing:
//!
//! - **Plain mode** sends well-known text (`POINT (1 2)`), which the server
//!   parses structurally.
//! - **Versioned mode** sends base64-encoded well-known binary, which must be
//!   byte-exact because the server hashes and diffs the blob.
//!
//! WKB here is the ISO little-endian encoding (byte order marker `1`),
//! restricted to the 2D types the engine replicates: Point, LineString,
//! Polygon. Inside the replica store, geometry is persisted as the WKB blob.

use crate::error::{Result, SyncError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;

/// A 2D geometry value carried by create/update/restore actions.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(f64, f64),
    LineString(Vec<(f64, f64)>),
    /// Outer ring first, then holes. Rings are stored as given; closure is
    /// the producer's responsibility.
    Polygon(Vec<Vec<(f64, f64)>>),
}

impl Geometry {
    /// Geometry type name as stored in the replica metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(..) => "POINT",
            Geometry::LineString(_) => "LINESTRING",
            Geometry::Polygon(_) => "POLYGON",
        }
    }

    // ── WKT (plain protocol) ────────────────────────────────────────────

    /// Serialize to well-known text.
    pub fn to_wkt(&self) -> String {
        fn coords(pts: &[(f64, f64)]) -> String {
            pts.iter()
                .map(|(x, y)| format!("{} {}", fmt_f64(*x), fmt_f64(*y)))
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            Geometry::Point(x, y) => format!("POINT ({} {})", fmt_f64(*x), fmt_f64(*y)),
            Geometry::LineString(pts) => format!("LINESTRING ({})", coords(pts)),
            Geometry::Polygon(rings) => {
                let rings = rings
                    .iter()
                    .map(|r| format!("({})", coords(r)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("POLYGON ({})", rings)
            }
        }
    }

    /// Parse well-known text.
    pub fn from_wkt(text: &str) -> Result<Self> {
        let text = text.trim();
        let (tag, rest) = text
            .find('(')
            .map(|i| (text[..i].trim().to_ascii_uppercase(), &text[i..]))
            .ok_or_else(|| SyncError::Synchronization(format!("malformed WKT: {}", text)))?;
        let body = strip_parens(rest)?;
        match tag.as_str() {
            "POINT" => {
                let pt = parse_coord(body)?;
                Ok(Geometry::Point(pt.0, pt.1))
            }
            "LINESTRING" => Ok(Geometry::LineString(parse_coord_list(body)?)),
            "POLYGON" => {
                let mut rings = Vec::new();
                for ring in split_rings(body)? {
                    rings.push(parse_coord_list(&ring)?);
                }
                if rings.is_empty() {
                    return Err(SyncError::Synchronization(
                        "polygon WKT has no rings".to_string(),
                    ));
                }
                Ok(Geometry::Polygon(rings))
            }
            other => Err(SyncError::Synchronization(format!(
                "unsupported WKT geometry type: {}",
                other
            ))),
        }
    }

    // ── WKB (versioned protocol, byte-exact) ────────────────────────────

    /// Serialize to little-endian ISO WKB.
    pub fn to_wkb(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(1); // little-endian
        match self {
            Geometry::Point(x, y) => {
                buf.extend_from_slice(&WKB_POINT.to_le_bytes());
                buf.extend_from_slice(&x.to_le_bytes());
                buf.extend_from_slice(&y.to_le_bytes());
            }
            Geometry::LineString(pts) => {
                buf.extend_from_slice(&WKB_LINESTRING.to_le_bytes());
                buf.extend_from_slice(&(pts.len() as u32).to_le_bytes());
                for (x, y) in pts {
                    buf.extend_from_slice(&x.to_le_bytes());
                    buf.extend_from_slice(&y.to_le_bytes());
                }
            }
            Geometry::Polygon(rings) => {
                buf.extend_from_slice(&WKB_POLYGON.to_le_bytes());
                buf.extend_from_slice(&(rings.len() as u32).to_le_bytes());
                for ring in rings {
                    buf.extend_from_slice(&(ring.len() as u32).to_le_bytes());
                    for (x, y) in ring {
                        buf.extend_from_slice(&x.to_le_bytes());
                        buf.extend_from_slice(&y.to_le_bytes());
                    }
                }
            }
        }
        buf
    }

    /// Parse little-endian ISO WKB.
    pub fn from_wkb(bytes: &[u8]) -> Result<Self> {
        let mut rd = WkbReader::new(bytes);
        if rd.u8()? != 1 {
            return Err(SyncError::Synchronization(
                "only little-endian WKB is supported".to_string(),
            ));
        }
        let geom = match rd.u32()? {
            WKB_POINT => Geometry::Point(rd.f64()?, rd.f64()?),
            WKB_LINESTRING => {
                let n = rd.u32()? as usize;
                Geometry::LineString(rd.coords(n)?)
            }
            WKB_POLYGON => {
                let nrings = rd.u32()? as usize;
                let mut rings = Vec::with_capacity(nrings);
                for _ in 0..nrings {
                    let n = rd.u32()? as usize;
                    rings.push(rd.coords(n)?);
                }
                Geometry::Polygon(rings)
            }
            other => {
                return Err(SyncError::Synchronization(format!(
                    "unsupported WKB geometry type: {}",
                    other
                )))
            }
        };
        if !rd.at_end() {
            return Err(SyncError::Synchronization(
                "trailing bytes after WKB geometry".to_string(),
            ));
        }
        Ok(geom)
    }

    /// Base64-encoded WKB, as the versioned protocol sends it.
    pub fn to_wkb_base64(&self) -> String {
        BASE64.encode(self.to_wkb())
    }

    /// Decode base64-encoded WKB.
    pub fn from_wkb_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| SyncError::Synchronization(format!("invalid base64 geometry: {}", e)))?;
        Self::from_wkb(&bytes)
    }
}

/// Format a coordinate the WKT way: integral values without a trailing `.0`.
fn fmt_f64(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn strip_parens(s: &str) -> Result<&str> {
    let s = s.trim();
    if s.starts_with('(') && s.ends_with(')') {
        Ok(&s[1..s.len() - 1])
    } else {
        Err(SyncError::Synchronization(format!(
            "unbalanced parentheses in WKT: {}",
            s
        )))
    }
}

fn parse_coord(s: &str) -> Result<(f64, f64)> {
    let mut it = s.split_whitespace();
    let x = it
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SyncError::Synchronization(format!("bad WKT coordinate: {}", s)))?;
    let y = it
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SyncError::Synchronization(format!("bad WKT coordinate: {}", s)))?;
    if it.next().is_some() {
        return Err(SyncError::Synchronization(format!(
            "only 2D coordinates are supported: {}",
            s
        )));
    }
    Ok((x, y))
}

fn parse_coord_list(s: &str) -> Result<Vec<(f64, f64)>> {
    s.split(',').map(parse_coord).collect()
}

/// Split `(...), (...)` into ring bodies, respecting nesting.
fn split_rings(s: &str) -> Result<Vec<String>> {
    let mut rings = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                if depth > 1 {
                    current.push(c);
                }
            }
            ')' => {
                if depth == 0 {
                    return Err(SyncError::Synchronization(
                        "unbalanced parentheses in polygon WKT".to_string(),
                    ));
                }
                depth -= 1;
                if depth == 0 {
                    rings.push(std::mem::take(&mut current));
                } else {
                    current.push(c);
                }
            }
            _ if depth > 0 => current.push(c),
            _ => {} // separators between rings
        }
    }
    if depth != 0 {
        return Err(SyncError::Synchronization(
            "unbalanced parentheses in polygon WKT".to_string(),
        ));
    }
    Ok(rings)
}

struct WkbReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WkbReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(SyncError::Synchronization("truncated WKB".to_string()));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn coords(&mut self, n: usize) -> Result<Vec<(f64, f64)>> {
        // Bound allocation by the remaining bytes, not the claimed count.
        if n > self.bytes.len() / 16 + 1 {
            return Err(SyncError::Synchronization(
                "WKB coordinate count exceeds payload".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push((self.f64()?, self.f64()?));
        }
        Ok(out)
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
