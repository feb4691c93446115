//! Geometry variants and coordinate positions.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// A single coordinate position.
///
/// In pixel frames `x`/`y` are column/row offsets; in the geographic frame
/// they are longitude/latitude in degrees with an optional elevation in
/// meters. Serialized as a GeoJSON position array of two or three numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl Position {
    /// Creates a 2D position.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    /// Creates a 3D position.
    pub fn with_elevation(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }

    /// Returns this position translated by the given offsets.
    #[inline]
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z,
        }
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.z.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.x)?;
        seq.serialize_element(&self.y)?;
        if let Some(z) = self.z {
            seq.serialize_element(&z)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PositionVisitor;

        impl<'de> Visitor<'de> for PositionVisitor {
            type Value = Position;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array of 2 or 3 numbers")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Position, A::Error> {
                let x = seq
                    .next_element::<f64>()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let y = seq
                    .next_element::<f64>()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let z = seq.next_element::<f64>()?;
                // Reject positions with more than three components
                if seq.next_element::<f64>()?.is_some() {
                    return Err(de::Error::invalid_length(4, &self));
                }
                Ok(Position { x, y, z })
            }
        }

        deserializer.deserialize_seq(PositionVisitor)
    }
}

/// Closed set of geometry kinds carried by detection features.
///
/// Models in the wild emit Points for detection centers, Polygons for
/// oriented boxes and segmentation outlines, and occasionally LineStrings.
/// MultiPolygon covers merged footprints. Anything else is rejected when the
/// model response is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    LineString(Vec<Position>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    /// Applies a fallible transform to every position, preserving structure.
    ///
    /// This is the primitive the feature lifter is built on: translation into
    /// the full-image frame and the sensor-model transform to geographic
    /// coordinates are both per-position maps.
    pub fn try_map<E>(
        &self,
        mut f: impl FnMut(&Position) -> Result<Position, E>,
    ) -> Result<Geometry, E> {
        match self {
            Geometry::Point(p) => Ok(Geometry::Point(f(p)?)),
            Geometry::LineString(line) => Ok(Geometry::LineString(
                line.iter().map(&mut f).collect::<Result<_, E>>()?,
            )),
            Geometry::Polygon(rings) => Ok(Geometry::Polygon(
                rings
                    .iter()
                    .map(|ring| ring.iter().map(&mut f).collect::<Result<_, E>>())
                    .collect::<Result<_, E>>()?,
            )),
            Geometry::MultiPolygon(polys) => Ok(Geometry::MultiPolygon(
                polys
                    .iter()
                    .map(|rings| {
                        rings
                            .iter()
                            .map(|ring| ring.iter().map(&mut f).collect::<Result<_, E>>())
                            .collect::<Result<_, E>>()
                    })
                    .collect::<Result<_, E>>()?,
            )),
        }
    }

    /// Translates every position by the given pixel offsets.
    pub fn translated(&self, dx: f64, dy: f64) -> Geometry {
        self.try_map::<std::convert::Infallible>(|p| Ok(p.translated(dx, dy)))
            .unwrap_or_else(|never| match never {})
    }

    /// Axis-aligned bounds `[min_x, min_y, max_x, max_y]`.
    ///
    /// Returns `None` for geometries with no positions (an empty LineString
    /// or Polygon, which a malformed model response can produce).
    pub fn bounds(&self) -> Option<[f64; 4]> {
        let mut bounds: Option<[f64; 4]> = None;
        let mut visit = |p: &Position| -> Result<Position, std::convert::Infallible> {
            bounds = Some(match bounds {
                None => [p.x, p.y, p.x, p.y],
                Some([min_x, min_y, max_x, max_y]) => [
                    min_x.min(p.x),
                    min_y.min(p.y),
                    max_x.max(p.x),
                    max_y.max(p.y),
                ],
            });
            Ok(*p)
        };
        let _ = self.try_map(&mut visit);
        bounds
    }

    /// Builds a closed rectangular Polygon from `[min_x, min_y, max_x, max_y]`.
    pub fn from_bbox(bbox: [f64; 4]) -> Geometry {
        let [min_x, min_y, max_x, max_y] = bbox;
        Geometry::Polygon(vec![vec![
            Position::new(min_x, min_y),
            Position::new(max_x, min_y),
            Position::new(max_x, max_y),
            Position::new(min_x, max_y),
            Position::new(min_x, min_y),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_roundtrip_2d() {
        let p = Position::new(10.5, -3.25);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "[10.5,-3.25]");
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_position_roundtrip_3d() {
        let p = Position::with_elevation(-122.4, 37.8, 12.0);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "[-122.4,37.8,12.0]");
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_position_rejects_short_array() {
        assert!(serde_json::from_str::<Position>("[1.0]").is_err());
    }

    #[test]
    fn test_position_rejects_long_array() {
        assert!(serde_json::from_str::<Position>("[1.0,2.0,3.0,4.0]").is_err());
    }

    #[test]
    fn test_geometry_tagged_serde() {
        let g = Geometry::Point(Position::new(5.0, 6.0));
        let json = serde_json::to_value(&g).unwrap();
        assert_eq!(json["type"], "Point");
        assert_eq!(json["coordinates"][0], 5.0);

        let back: Geometry = serde_json::from_value(json).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_geometry_rejects_unknown_kind() {
        let json = r#"{"type":"GeometryCollection","coordinates":[]}"#;
        assert!(serde_json::from_str::<Geometry>(json).is_err());
    }

    #[test]
    fn test_translated_polygon() {
        let g = Geometry::from_bbox([0.0, 0.0, 10.0, 20.0]).translated(100.0, 200.0);
        assert_eq!(g.bounds(), Some([100.0, 200.0, 110.0, 220.0]));
    }

    #[test]
    fn test_bounds_point() {
        let g = Geometry::Point(Position::new(4.0, 9.0));
        assert_eq!(g.bounds(), Some([4.0, 9.0, 4.0, 9.0]));
    }

    #[test]
    fn test_bounds_empty_linestring() {
        let g = Geometry::LineString(vec![]);
        assert_eq!(g.bounds(), None);
    }

    #[test]
    fn test_try_map_propagates_error() {
        let g = Geometry::LineString(vec![Position::new(0.0, 0.0), Position::new(1.0, 1.0)]);
        let result = g.try_map(|p| {
            if p.x > 0.5 {
                Err("out of range")
            } else {
                Ok(*p)
            }
        });
        assert_eq!(result, Err("out of range"));
    }
}
