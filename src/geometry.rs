//! Geometry kinds and decoders for the well-known binary encoding and the
//! GeoPackage binary wrapper around it.

use std::fmt;
use std::io::{self, Cursor, Read};
use std::str::FromStr;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};

/// The canonical geometry kinds a layer can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    Collection,
}

impl GeometryKind {
    pub fn of(geometry: &Geometry<f64>) -> Option<Self> {
        Some(match geometry {
            Geometry::Point(_) => GeometryKind::Point,
            Geometry::LineString(_) => GeometryKind::LineString,
            Geometry::Polygon(_) => GeometryKind::Polygon,
            Geometry::MultiPoint(_) => GeometryKind::MultiPoint,
            Geometry::MultiLineString(_) => GeometryKind::MultiLineString,
            Geometry::MultiPolygon(_) => GeometryKind::MultiPolygon,
            Geometry::GeometryCollection(_) => GeometryKind::Collection,
            _ => return None,
        })
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeometryKind::Point => "Point",
            GeometryKind::LineString => "LineString",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::MultiPoint => "MultiPoint",
            GeometryKind::MultiLineString => "MultiLineString",
            GeometryKind::MultiPolygon => "MultiPolygon",
            GeometryKind::Collection => "GeometryCollection",
        };
        f.write_str(name)
    }
}

/// Parses both configuration spellings (`linestring`) and PostGIS type names
/// (`ST_LineString`), ignoring case.
impl FromStr for GeometryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("st_").unwrap_or(&lower);
        match name {
            "point" => Ok(GeometryKind::Point),
            "linestring" => Ok(GeometryKind::LineString),
            "polygon" => Ok(GeometryKind::Polygon),
            "multipoint" => Ok(GeometryKind::MultiPoint),
            "multilinestring" => Ok(GeometryKind::MultiLineString),
            "multipolygon" => Ok(GeometryKind::MultiPolygon),
            "geometrycollection" | "collection" => Ok(GeometryKind::Collection),
            _ => Err(s.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WkbError {
    #[error("unknown geometry type {0}")]
    UnknownGeometryType(u32),

    #[error("invalid byte order marker {0}")]
    InvalidByteOrder(u8),

    #[error("multi geometry part does not match its parent type")]
    MismatchedPart,

    #[error("invalid geopackage header: {0}")]
    InvalidHeader(&'static str),

    #[error("truncated geometry: {0}")]
    Truncated(#[from] io::Error),
}

const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const EWKB_Z_FLAG: u32 = 0x8000_0000;
const EWKB_M_FLAG: u32 = 0x4000_0000;

/// Decodes a 2D WKB (or EWKB with an embedded SRID) geometry.
///
/// Geometries carrying Z or M ordinates are reported as
/// [`WkbError::UnknownGeometryType`] so callers can skip them.
pub fn decode_wkb(bytes: &[u8]) -> Result<Geometry<f64>, WkbError> {
    let mut reader = Cursor::new(bytes);
    read_geometry(&mut reader)
}

const GPKG_MAGIC: [u8; 2] = *b"GP";
const GPKG_EMPTY_FLAG: u8 = 0x10;
const GPKG_EXTENDED_FLAG: u8 = 0x20;

/// A geometry stored in a GeoPackage feature table.
#[derive(Clone, Debug, PartialEq)]
pub struct GpkgGeometry {
    pub srs_id: i32,
    /// `None` when the header marks the geometry as empty.
    pub geometry: Option<Geometry<f64>>,
}

/// Decodes a GeoPackage geometry blob: a `GP` header carrying the SRS id and
/// an optional envelope, followed by WKB.
pub fn decode_gpkg(bytes: &[u8]) -> Result<GpkgGeometry, WkbError> {
    let mut reader = Cursor::new(bytes);
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic)?;
    if magic != GPKG_MAGIC {
        return Err(WkbError::InvalidHeader("missing GP magic"));
    }
    let _version = reader.read_u8()?;
    let flags = reader.read_u8()?;
    if flags & GPKG_EXTENDED_FLAG != 0 {
        return Err(WkbError::InvalidHeader("extended geometry types are not supported"));
    }

    let srs_id = if flags & 1 == 1 {
        reader.read_i32::<LittleEndian>()?
    } else {
        reader.read_i32::<BigEndian>()?
    };
    let envelope: u64 = match (flags >> 1) & 0b111 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        _ => return Err(WkbError::InvalidHeader("invalid envelope indicator")),
    };
    let wkb_start = reader.position() + envelope;
    if wkb_start > bytes.len() as u64 {
        return Err(WkbError::Truncated(io::ErrorKind::UnexpectedEof.into()));
    }
    reader.set_position(wkb_start);

    if flags & GPKG_EMPTY_FLAG != 0 {
        return Ok(GpkgGeometry {
            srs_id,
            geometry: None,
        });
    }
    Ok(GpkgGeometry {
        srs_id,
        geometry: Some(read_geometry(&mut reader)?),
    })
}

fn read_geometry<R: Read>(r: &mut R) -> Result<Geometry<f64>, WkbError> {
    match r.read_u8()? {
        0 => read_body::<BigEndian, R>(r),
        1 => read_body::<LittleEndian, R>(r),
        other => Err(WkbError::InvalidByteOrder(other)),
    }
}

fn read_body<B: byteorder::ByteOrder, R: Read>(r: &mut R) -> Result<Geometry<f64>, WkbError> {
    let raw_type = r.read_u32::<B>()?;
    if raw_type & (EWKB_Z_FLAG | EWKB_M_FLAG) != 0 {
        return Err(WkbError::UnknownGeometryType(raw_type));
    }
    if raw_type & EWKB_SRID_FLAG != 0 {
        // the srid is carried by the layer
        r.read_u32::<B>()?;
    }

    Ok(match raw_type & !EWKB_SRID_FLAG {
        1 => Geometry::Point(read_point::<B, R>(r)?),
        2 => Geometry::LineString(read_line_string::<B, R>(r)?),
        3 => Geometry::Polygon(read_polygon::<B, R>(r)?),
        4 => Geometry::MultiPoint(MultiPoint(read_parts::<B, R, _, _>(r, |g| match g {
            Geometry::Point(p) => Some(p),
            _ => None,
        })?)),
        5 => Geometry::MultiLineString(MultiLineString(read_parts::<B, R, _, _>(r, |g| match g {
            Geometry::LineString(l) => Some(l),
            _ => None,
        })?)),
        6 => Geometry::MultiPolygon(MultiPolygon(read_parts::<B, R, _, _>(r, |g| match g {
            Geometry::Polygon(p) => Some(p),
            _ => None,
        })?)),
        7 => {
            let count = r.read_u32::<B>()?;
            let mut geometries = Vec::with_capacity(capacity(count));
            for _ in 0..count {
                geometries.push(read_geometry(r)?);
            }
            Geometry::GeometryCollection(GeometryCollection(geometries))
        }
        other => return Err(WkbError::UnknownGeometryType(other)),
    })
}

// Cap pre-allocation so a corrupt count cannot reserve gigabytes.
fn capacity(count: u32) -> usize {
    (count as usize).min(1024)
}

fn read_coord<B: byteorder::ByteOrder, R: Read>(r: &mut R) -> Result<Coord<f64>, WkbError> {
    let x = r.read_f64::<B>()?;
    let y = r.read_f64::<B>()?;
    Ok(Coord { x, y })
}

fn read_point<B: byteorder::ByteOrder, R: Read>(r: &mut R) -> Result<Point<f64>, WkbError> {
    Ok(Point(read_coord::<B, R>(r)?))
}

fn read_line_string<B: byteorder::ByteOrder, R: Read>(
    r: &mut R,
) -> Result<LineString<f64>, WkbError> {
    let count = r.read_u32::<B>()?;
    let mut coords = Vec::with_capacity(capacity(count));
    for _ in 0..count {
        coords.push(read_coord::<B, R>(r)?);
    }
    Ok(LineString(coords))
}

fn read_polygon<B: byteorder::ByteOrder, R: Read>(r: &mut R) -> Result<Polygon<f64>, WkbError> {
    let count = r.read_u32::<B>()?;
    if count == 0 {
        return Ok(Polygon::new(LineString(vec![]), vec![]));
    }
    let exterior = read_line_string::<B, R>(r)?;
    let mut interiors = Vec::with_capacity(capacity(count - 1));
    for _ in 1..count {
        interiors.push(read_line_string::<B, R>(r)?);
    }
    Ok(Polygon::new(exterior, interiors))
}

/// Multi geometries repeat a full header (byte order + type) per part.
fn read_parts<B, R, T, F>(r: &mut R, part: F) -> Result<Vec<T>, WkbError>
where
    B: byteorder::ByteOrder,
    R: Read,
    F: Fn(Geometry<f64>) -> Option<T>,
{
    let count = r.read_u32::<B>()?;
    let mut parts = Vec::with_capacity(capacity(count));
    for _ in 0..count {
        parts.push(part(read_geometry(r)?).ok_or(WkbError::MismatchedPart)?);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;

    use super::*;

    fn header(buf: &mut Vec<u8>, kind: u32) {
        buf.push(1);
        buf.write_u32::<LittleEndian>(kind).unwrap();
    }

    fn coord(buf: &mut Vec<u8>, x: f64, y: f64) {
        buf.write_f64::<LittleEndian>(x).unwrap();
        buf.write_f64::<LittleEndian>(y).unwrap();
    }

    fn point(x: f64, y: f64) -> Vec<u8> {
        let mut buf = Vec::new();
        header(&mut buf, 1);
        coord(&mut buf, x, y);
        buf
    }

    #[test]
    fn test_decode_point_both_byte_orders() {
        assert_eq!(
            Geometry::Point(Point::new(1.5, -2.0)),
            decode_wkb(&point(1.5, -2.0)).unwrap()
        );

        let mut big = vec![0u8];
        big.write_u32::<BigEndian>(1).unwrap();
        big.write_f64::<BigEndian>(1.5).unwrap();
        big.write_f64::<BigEndian>(-2.0).unwrap();
        assert_eq!(
            Geometry::Point(Point::new(1.5, -2.0)),
            decode_wkb(&big).unwrap()
        );
    }

    #[test]
    fn test_decode_polygon_with_hole() {
        let mut buf = Vec::new();
        header(&mut buf, 3);
        buf.write_u32::<LittleEndian>(2).unwrap();
        for ring in [
            &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 0.0)][..],
            &[(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 1.0)][..],
        ] {
            buf.write_u32::<LittleEndian>(ring.len() as u32).unwrap();
            for (x, y) in ring {
                coord(&mut buf, *x, *y);
            }
        }

        match decode_wkb(&buf).unwrap() {
            Geometry::Polygon(p) => {
                assert_eq!(4, p.exterior().0.len());
                assert_eq!(1, p.interiors().len());
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_decode_multipoint_and_collection() {
        let mut multi = Vec::new();
        header(&mut multi, 4);
        multi.write_u32::<LittleEndian>(2).unwrap();
        multi.extend(point(1.0, 1.0));
        multi.extend(point(2.0, 2.0));
        let decoded = decode_wkb(&multi).unwrap();
        assert_eq!(Some(GeometryKind::MultiPoint), GeometryKind::of(&decoded));

        let mut collection = Vec::new();
        header(&mut collection, 7);
        collection.write_u32::<LittleEndian>(2).unwrap();
        collection.extend(point(0.0, 0.0));
        collection.extend(multi);
        match decode_wkb(&collection).unwrap() {
            Geometry::GeometryCollection(c) => assert_eq!(2, c.0.len()),
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_decode_ewkb_srid_is_skipped() {
        let mut buf = Vec::new();
        header(&mut buf, 1 | EWKB_SRID_FLAG);
        buf.write_u32::<LittleEndian>(3857).unwrap();
        coord(&mut buf, 3.0, 4.0);
        assert_eq!(
            Geometry::Point(Point::new(3.0, 4.0)),
            decode_wkb(&buf).unwrap()
        );
    }

    #[test]
    fn test_three_dimensional_geometries_are_unknown() {
        let mut iso_z = Vec::new();
        header(&mut iso_z, 1001);
        coord(&mut iso_z, 1.0, 2.0);
        iso_z.write_f64::<LittleEndian>(3.0).unwrap();
        assert!(matches!(
            decode_wkb(&iso_z),
            Err(WkbError::UnknownGeometryType(1001))
        ));

        let mut ewkb_z = Vec::new();
        header(&mut ewkb_z, 1 | EWKB_Z_FLAG);
        assert!(matches!(
            decode_wkb(&ewkb_z),
            Err(WkbError::UnknownGeometryType(_))
        ));
    }

    #[test]
    fn test_truncated_and_garbage_input() {
        let mut buf = point(1.0, 2.0);
        buf.truncate(10);
        assert!(matches!(decode_wkb(&buf), Err(WkbError::Truncated(_))));
        assert!(matches!(
            decode_wkb(&[7, 1, 0, 0, 0]),
            Err(WkbError::InvalidByteOrder(7))
        ));
    }

    fn gpkg(flags: u8, srs_id: i32, envelope: usize, wkb: &[u8]) -> Vec<u8> {
        let mut buf = b"GP".to_vec();
        buf.push(0);
        buf.push(flags);
        if flags & 1 == 1 {
            buf.write_i32::<LittleEndian>(srs_id).unwrap();
        } else {
            buf.write_i32::<BigEndian>(srs_id).unwrap();
        }
        buf.extend(std::iter::repeat(0u8).take(envelope));
        buf.extend_from_slice(wkb);
        buf
    }

    #[test]
    fn test_decode_gpkg_headers() {
        // little endian, no envelope
        let plain = decode_gpkg(&gpkg(0b0000_0001, 4326, 0, &point(7.0, 8.0))).unwrap();
        assert_eq!(4326, plain.srs_id);
        assert_eq!(Some(Geometry::Point(Point::new(7.0, 8.0))), plain.geometry);

        // big endian, xy envelope
        let boxed = decode_gpkg(&gpkg(0b0000_0010, 3857, 32, &point(1.0, 2.0))).unwrap();
        assert_eq!(3857, boxed.srs_id);
        assert_eq!(Some(Geometry::Point(Point::new(1.0, 2.0))), boxed.geometry);

        // xyzm envelope
        let xyzm = decode_gpkg(&gpkg(0b0000_1001, 4326, 64, &point(3.0, 4.0))).unwrap();
        assert_eq!(Some(Geometry::Point(Point::new(3.0, 4.0))), xyzm.geometry);

        let empty = decode_gpkg(&gpkg(0b0001_0001, 4326, 0, &point(f64::NAN, f64::NAN))).unwrap();
        assert_eq!(None, empty.geometry);
    }

    #[test]
    fn test_decode_gpkg_rejects_bad_headers() {
        assert!(matches!(
            decode_gpkg(&point(1.0, 2.0)),
            Err(WkbError::InvalidHeader(_))
        ));
        assert!(matches!(
            decode_gpkg(&gpkg(0b0000_1011, 4326, 0, &point(1.0, 2.0))),
            Err(WkbError::InvalidHeader(_))
        ));
        assert!(matches!(
            decode_gpkg(&gpkg(0b0010_0001, 4326, 0, &point(1.0, 2.0))),
            Err(WkbError::InvalidHeader(_))
        ));
        assert!(matches!(
            decode_gpkg(&gpkg(0b0000_0011, 4326, 8, &[])),
            Err(WkbError::Truncated(_))
        ));
    }

    #[test]
    fn test_parse_geometry_kind() {
        assert_eq!(Ok(GeometryKind::Point), "ST_Point".parse());
        assert_eq!(Ok(GeometryKind::MultiLineString), "multilinestring".parse());
        assert_eq!(Ok(GeometryKind::Collection), "ST_GeometryCollection".parse());
        assert_eq!(Ok(GeometryKind::Polygon), "POLYGON".parse());
        assert!("ST_Triangle".parse::<GeometryKind>().is_err());
    }
}
