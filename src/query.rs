//! Query templates and the SQL synthesized from them.
//!
//! A layer query is a SQL template carrying placeholder tokens. Tokens are
//! parsed once, at registration, and substituted for every tile:
//!
//! * `!BBOX!` (also spelled `!BOX!` or `!bbox!`) becomes the buffered tile
//!   envelope in the layer's SRID. It is required.
//! * `!BBOX_NOBUFFER!` becomes the tile envelope without the buffer.
//! * `!ZOOM!` becomes the tile's zoom. When the query is rendered for every
//!   zoom, a preceding comparison operator turns into `IN (0,…,24)` and a bare
//!   token into `ANY('{0,…,24}')`.
//! * `!SCALE_DENOMINATOR!`, `!PIXEL_WIDTH!` and `!PIXEL_HEIGHT!` become the
//!   corresponding numbers for the tile.

use std::fmt;

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::provider::ProviderKind;
use crate::tile::{Bounds, TileRequest, DEFAULT_TILE_BUFFER, MVT_EXTENT, WEB_MERCATOR, WGS84};
use crate::{Error, Result};

pub const BBOX_TOKEN: &str = "!BBOX!";
pub const BBOX_NOBUFFER_TOKEN: &str = "!BBOX_NOBUFFER!";
pub const ZOOM_TOKEN: &str = "!ZOOM!";
pub const SCALE_DENOMINATOR_TOKEN: &str = "!SCALE_DENOMINATOR!";
pub const PIXEL_WIDTH_TOKEN: &str = "!PIXEL_WIDTH!";
pub const PIXEL_HEIGHT_TOKEN: &str = "!PIXEL_HEIGHT!";

const TOKEN_ALIASES: [(&str, &str); 3] = [
    ("!BOX!", BBOX_TOKEN),
    ("!bbox!", BBOX_TOKEN),
    ("!bbox_nobuffer!", BBOX_NOBUFFER_TOKEN),
];

/// Highest zoom enumerated when a query is rendered for every zoom.
pub const ZOOM_CEILING: u8 = 24;

// Longer spellings first so `<=` is not read as `=`.
const ZOOM_OPERATORS: [&str; 8] = [">=", "=>", "<=", "=<", "!=", "=", ">", "<"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoomMode {
    /// Substitute the tile's own zoom.
    Explicit,
    /// Match every zoom from 0 to [`ZOOM_CEILING`]. Used by probes.
    AllZooms,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    BBox,
    BBoxNoBuffer,
    Zoom,
    ScaleDenominator,
    PixelWidth,
    PixelHeight,
}

impl Token {
    const ALL: [Token; 6] = [
        Token::BBox,
        Token::BBoxNoBuffer,
        Token::Zoom,
        Token::ScaleDenominator,
        Token::PixelWidth,
        Token::PixelHeight,
    ];

    fn text(self) -> &'static str {
        match self {
            Token::BBox => BBOX_TOKEN,
            Token::BBoxNoBuffer => BBOX_NOBUFFER_TOKEN,
            Token::Zoom => ZOOM_TOKEN,
            Token::ScaleDenominator => SCALE_DENOMINATOR_TOKEN,
            Token::PixelWidth => PIXEL_WIDTH_TOKEN,
            Token::PixelHeight => PIXEL_HEIGHT_TOKEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Text(String),
    Token(Token),
    /// `!ZOOM!`, with the comparison operator written right before it.
    Zoom { operator: Option<&'static str> },
}

/// A SQL string split into literal text and placeholder tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlTemplate {
    segments: Vec<Segment>,
}

impl SqlTemplate {
    pub fn parse(sql: &str) -> Self {
        let sql = TOKEN_ALIASES
            .iter()
            .fold(sql.to_string(), |sql, (alias, token)| sql.replace(alias, token));

        let mut segments = Vec::new();
        let mut rest = sql.as_str();
        while let Some((pos, token)) = next_token(rest) {
            let mut text = rest[..pos].to_string();
            let segment = match token {
                Token::Zoom => Segment::Zoom {
                    operator: take_operator(&mut text),
                },
                token => Segment::Token(token),
            };
            if !text.is_empty() {
                segments.push(Segment::Text(text));
            }
            segments.push(segment);
            rest = &rest[pos + token.text().len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        SqlTemplate { segments }
    }

    pub fn has_bbox(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Token(Token::BBox)))
    }

    pub fn has_zoom(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Zoom { .. }))
    }

    pub fn render(&self, values: &TokenValues) -> String {
        let mut sql = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Token(Token::BBox) => sql.push_str(&values.bbox),
                Segment::Token(Token::BBoxNoBuffer) => sql.push_str(&values.tile_envelope),
                Segment::Token(Token::ScaleDenominator) => {
                    sql.push_str(&values.scale_denominator.to_string())
                }
                Segment::Token(Token::PixelWidth) => sql.push_str(&values.pixel_width.to_string()),
                Segment::Token(Token::PixelHeight) => {
                    sql.push_str(&values.pixel_height.to_string())
                }
                Segment::Token(Token::Zoom) => sql.push_str(&values.zoom_literal(None)),
                Segment::Zoom { operator } => sql.push_str(&values.zoom_literal(*operator)),
            }
        }
        sql
    }
}

/// Reproduces the template with canonical token spellings.
impl fmt::Display for SqlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => f.write_str(text)?,
                Segment::Token(token) => f.write_str(token.text())?,
                Segment::Zoom { operator: Some(op) } => write!(f, "{op} {ZOOM_TOKEN}")?,
                Segment::Zoom { operator: None } => f.write_str(ZOOM_TOKEN)?,
            }
        }
        Ok(())
    }
}

fn next_token(sql: &str) -> Option<(usize, Token)> {
    Token::ALL
        .iter()
        .filter_map(|token| sql.find(token.text()).map(|pos| (pos, *token)))
        .min_by_key(|(pos, _)| *pos)
}

/// Strips a trailing comparison operator (and the whitespace around it) off
/// `text`.
fn take_operator(text: &mut String) -> Option<&'static str> {
    let trimmed = text.trim_end();
    let operator = ZOOM_OPERATORS
        .iter()
        .copied()
        .find(|op| trimmed.ends_with(op))?;
    let keep = trimmed.len() - operator.len();
    text.truncate(keep);
    Some(operator)
}

/// Everything a template needs to be rendered for one tile.
#[derive(Clone, Debug)]
pub struct TokenValues {
    bbox: String,
    tile_envelope: String,
    zoom: u8,
    mode: ZoomMode,
    scale_denominator: f64,
    pixel_width: f64,
    pixel_height: f64,
}

impl TokenValues {
    pub fn new(tile: &TileRequest, srid: u32, mode: ZoomMode) -> Self {
        Self::with_envelopes(
            tile,
            envelope_sql(&tile.buffered_bounds(), srid),
            envelope_sql(&tile.bounds(), srid),
            mode,
        )
    }

    /// Values for a backend with its own spelling of the tile envelopes.
    pub fn with_envelopes(tile: &TileRequest, bbox: String, tile_envelope: String, mode: ZoomMode) -> Self {
        TokenValues {
            bbox,
            tile_envelope,
            zoom: tile.zoom,
            mode,
            scale_denominator: tile.scale_denominator(),
            pixel_width: tile.pixel_width(),
            pixel_height: tile.pixel_height(),
        }
    }

    pub fn bbox(&self) -> &str {
        &self.bbox
    }

    fn zoom_literal(&self, operator: Option<&str>) -> String {
        match (self.mode, operator) {
            (ZoomMode::Explicit, Some(op)) => format!("{} {}", op, self.zoom),
            (ZoomMode::Explicit, None) => self.zoom.to_string(),
            (ZoomMode::AllZooms, Some(_)) => format!("IN ({})", all_zooms()),
            (ZoomMode::AllZooms, None) => format!("ANY('{{{}}}')", all_zooms()),
        }
    }
}

fn all_zooms() -> String {
    (0..=ZOOM_CEILING)
        .map(|z| z.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Renders EPSG:3857 bounds as an envelope in `srid`.
pub fn envelope_sql(bounds: &Bounds, srid: u32) -> String {
    match srid {
        WEB_MERCATOR => make_envelope(bounds, WEB_MERCATOR),
        WGS84 => make_envelope(&bounds.to_wgs84(), WGS84),
        other => format!(
            "ST_Transform({}, {})",
            make_envelope(bounds, WEB_MERCATOR),
            other
        ),
    }
}

fn make_envelope(b: &Bounds, srid: u32) -> String {
    format!(
        "ST_MakeEnvelope({},{},{},{},{})",
        b.west, b.south, b.east, b.north, srid
    )
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Whether `sql` is a full SELECT statement rather than a table expression.
pub fn is_select_query(sql: &str) -> Result<bool> {
    static SELECT: OnceCell<Regex> = OnceCell::new();
    let regex = SELECT.get_or_try_init(|| Regex::new(r"(?i)^((\s*)(--.*\n)?)*select"))?;
    Ok(regex.is_match(sql))
}

/// Where the rows of a layer come from.
#[derive(Clone, Debug, PartialEq)]
pub enum QuerySource {
    /// A table (or table expression) the query was generated for.
    Table(String),
    /// A SELECT supplied in the layer configuration.
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    GeometryType,
    Extent,
    Count,
}

/// The query of one layer, with the field names needed to read its rows.
#[derive(Clone, Debug)]
pub struct LayerQuery {
    source: QuerySource,
    template: SqlTemplate,
    pub srid: u32,
    pub kind: ProviderKind,
    pub geom_field: String,
    pub id_field: Option<String>,
    /// Columns read into tags. Empty for custom queries, whose tags are
    /// whatever else the query returns.
    pub tag_fields: Vec<String>,
}

impl LayerQuery {
    /// Generates the query for a table. The id field is selected even when
    /// it is missing from `fields`.
    pub fn table(
        table: &str,
        fields: &[String],
        geom_field: &str,
        id_field: Option<&str>,
        srid: u32,
        kind: ProviderKind,
    ) -> Self {
        let mut columns: Vec<&str> = Vec::new();
        for field in fields.iter().map(String::as_str) {
            if field != geom_field && !columns.contains(&field) {
                columns.push(field);
            }
        }
        if let Some(id) = id_field {
            if !columns.contains(&id) {
                columns.push(id);
            }
        }

        let mut select: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        select.push(geometry_projection(geom_field, srid, kind));

        let sql = format!(
            "SELECT {} FROM {} WHERE {} && {}",
            select.join(", "),
            table,
            quote_ident(geom_field),
            BBOX_TOKEN
        );

        LayerQuery {
            source: QuerySource::Table(table.to_string()),
            template: SqlTemplate::parse(&sql),
            srid,
            kind,
            geom_field: geom_field.to_string(),
            id_field: id_field.map(str::to_string),
            tag_fields: columns
                .into_iter()
                .filter(|c| Some(*c) != id_field)
                .map(str::to_string)
                .collect(),
        }
    }

    /// Wraps a configured SELECT, checking it carries the bounding box token
    /// and, unless it selects `*`, both special fields.
    pub fn custom(
        layer: &str,
        sql: &str,
        geom_field: &str,
        id_field: Option<&str>,
        srid: u32,
        kind: ProviderKind,
    ) -> Result<Self> {
        let template = SqlTemplate::parse(sql);
        if !template.has_bbox() {
            return Err(Error::MissingToken {
                layer: layer.to_string(),
                token: BBOX_TOKEN,
            });
        }

        if !sql.contains('*') {
            for field in std::iter::once(geom_field).chain(id_field) {
                if !sql.contains(field) {
                    return Err(Error::MissingField {
                        layer: layer.to_string(),
                        field: field.to_string(),
                    });
                }
            }
        }

        Ok(LayerQuery {
            source: QuerySource::Custom,
            template,
            srid,
            kind,
            geom_field: geom_field.to_string(),
            id_field: id_field.map(str::to_string),
            tag_fields: Vec::new(),
        })
    }

    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    pub fn template(&self) -> &SqlTemplate {
        &self.template
    }

    pub fn synthesize(&self, tile: &TileRequest, mode: ZoomMode) -> String {
        self.template
            .render(&TokenValues::new(tile, self.srid, mode))
    }

    /// Builds a probe over the rows matching `tile` in every zoom.
    ///
    /// Table layers are probed on the table itself. Custom queries are
    /// wrapped as a sub-query, decoding their WKB output again.
    pub fn probe(&self, probe: Probe, tile: &TileRequest) -> String {
        let (from, filter, geom) = match &self.source {
            QuerySource::Table(table) => {
                let values = TokenValues::new(tile, self.srid, ZoomMode::AllZooms);
                let geom = quote_ident(&self.geom_field);
                let filter = format!("{} && {}", geom, values.bbox());
                (table.clone(), Some(filter), geom)
            }
            QuerySource::Custom => {
                let inner = self.synthesize(tile, ZoomMode::AllZooms);
                let column = format!("q.{}", quote_ident(&self.geom_field));
                let geom = match self.kind {
                    ProviderKind::Standard => format!("ST_GeomFromWKB({}, {})", column, self.srid),
                    ProviderKind::NativeTile => column,
                };
                (format!("({}) AS q", inner), None, geom)
            }
        };

        let where_clause = |extra: Option<String>| {
            let clauses: Vec<String> = filter.iter().cloned().chain(extra).collect();
            if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            }
        };

        match probe {
            Probe::GeometryType => format!(
                "SELECT ST_GeometryType({geom}) FROM {from}{} LIMIT 1",
                where_clause(Some(format!("{geom} IS NOT NULL")))
            ),
            Probe::Extent => {
                let geom = if self.srid == WGS84 {
                    geom
                } else {
                    format!("ST_Transform({}, {})", geom, WGS84)
                };
                format!(
                    "SELECT CAST(ST_Extent({geom}) AS text) FROM {from}{}",
                    where_clause(None)
                )
            }
            Probe::Count => format!("SELECT COUNT(*) FROM {from}{}", where_clause(None)),
        }
    }
}

impl fmt::Display for LayerQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.template.fmt(f)
    }
}

/// `ST_AsBinary` for feature layers, `ST_AsMVTGeom` in tile space for native
/// tile layers.
fn geometry_projection(geom_field: &str, srid: u32, kind: ProviderKind) -> String {
    let geom = quote_ident(geom_field);
    match kind {
        ProviderKind::Standard => format!("ST_AsBinary({geom}) AS {geom}"),
        ProviderKind::NativeTile => {
            let (source, envelope) = if srid == WEB_MERCATOR {
                (geom.clone(), BBOX_NOBUFFER_TOKEN.to_string())
            } else {
                (
                    format!("ST_Transform({geom}, {WEB_MERCATOR})"),
                    format!("ST_Transform({BBOX_NOBUFFER_TOKEN}, {WEB_MERCATOR})"),
                )
            };
            format!(
                "ST_AsMVTGeom({source}, {envelope}, {MVT_EXTENT}, {DEFAULT_TILE_BUFFER}, true) AS {geom}"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;
    use crate::tile::get_epsg_3857_tile_bounds;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_normalises_bbox_aliases() {
        let template = SqlTemplate::parse("SELECT * FROM a WHERE geom && !BOX! OR geom && !bbox!");
        assert!(template.has_bbox());
        assert_eq!(
            "SELECT * FROM a WHERE geom && !BBOX! OR geom && !BBOX!",
            template.to_string()
        );
    }

    #[test]
    fn test_bbox_matches_buffered_tile_bounds() {
        let template = SqlTemplate::parse("SELECT * FROM a WHERE geom && !BBOX!");
        for (zoom, x, y, buffer) in [(0u8, 0u32, 0u32, 0u32), (5, 17, 11, 64), (14, 8800, 5370, 16)] {
            let tile = TileRequest::new(zoom, x, y, buffer, WEB_MERCATOR);
            let b = get_epsg_3857_tile_bounds(256, zoom, x, y, buffer);
            let sql = template.render(&TokenValues::new(&tile, WEB_MERCATOR, ZoomMode::Explicit));

            assert_eq!(
                format!(
                    "SELECT * FROM a WHERE geom && ST_MakeEnvelope({},{},{},{},3857)",
                    b.west, b.south, b.east, b.north
                ),
                sql
            );
        }
    }

    #[test]
    fn test_bbox_in_other_projections() {
        let tile = TileRequest::new(0, 0, 0, 0, WEB_MERCATOR);
        let wgs84 = TokenValues::new(&tile, WGS84, ZoomMode::Explicit);
        assert_eq!(wgs84.bbox().starts_with("ST_MakeEnvelope(-1"), true);
        assert_eq!(wgs84.bbox().ends_with(",4326)"), true);

        let swiss = TokenValues::new(&tile, 2056, ZoomMode::Explicit);
        assert_eq!(swiss.bbox().starts_with("ST_Transform(ST_MakeEnvelope("), true);
        assert_eq!(swiss.bbox().ends_with(",3857), 2056)"), true);
    }

    #[test]
    fn test_zoom_substitution() {
        let tile = TileRequest::web_mercator(7, 1, 1);
        let explicit = TokenValues::new(&tile, WEB_MERCATOR, ZoomMode::Explicit);
        let all = TokenValues::new(&tile, WEB_MERCATOR, ZoomMode::AllZooms);
        let zooms = "0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24";

        let bare = SqlTemplate::parse("SELECT !ZOOM! AS z, geom FROM a WHERE geom && !BBOX!");
        assert_eq!(bare.has_zoom(), true);
        assert_eq!(bare.render(&explicit).starts_with("SELECT 7 AS z"), true);
        assert_eq!(
            bare.render(&all).starts_with(&format!("SELECT ANY('{{{zooms}}}') AS z")),
            true
        );

        let compared = SqlTemplate::parse("SELECT geom FROM a WHERE min_zoom <= !ZOOM! AND geom && !BBOX!");
        assert_eq!(
            compared.render(&explicit).starts_with("SELECT geom FROM a WHERE min_zoom <= 7 AND"),
            true
        );
        assert_eq!(
            compared
                .render(&all)
                .starts_with(&format!("SELECT geom FROM a WHERE min_zoom IN ({zooms}) AND")),
            true
        );
    }

    #[test]
    fn test_zoom_operators_are_captured() {
        for op in ZOOM_OPERATORS {
            let template = SqlTemplate::parse(&format!("SELECT geom FROM a WHERE z {op} !ZOOM!"));
            assert_eq!(
                format!("SELECT geom FROM a WHERE z {op} !ZOOM!"),
                template.to_string()
            );

            let tile = TileRequest::web_mercator(3, 0, 0);
            let sql = template.render(&TokenValues::new(&tile, WEB_MERCATOR, ZoomMode::AllZooms));
            assert_eq!(sql.starts_with("SELECT geom FROM a WHERE z IN (0,1,"), true);
        }
    }

    #[test]
    fn test_scale_tokens() {
        let tile = TileRequest::web_mercator(0, 0, 0);
        let template = SqlTemplate::parse("!SCALE_DENOMINATOR! !PIXEL_WIDTH! !PIXEL_HEIGHT!");
        let sql = template.render(&TokenValues::new(&tile, WEB_MERCATOR, ZoomMode::Explicit));

        let parts: Vec<f64> = sql.split(' ').map(|p| p.parse().unwrap()).collect();
        assert_eq!(3, parts.len());
        assert_approx_eq!(parts[0], tile.scale_denominator());
        assert_approx_eq!(parts[1], 156_543.033_928_041, 1e-6);
        assert_approx_eq!(parts[2], parts[1]);
    }

    #[test]
    fn test_custom_query_validation() {
        let missing_bbox = LayerQuery::custom(
            "roads",
            "SELECT gid, ST_AsBinary(geom) AS geom FROM roads",
            "geom",
            Some("gid"),
            WEB_MERCATOR,
            ProviderKind::Standard,
        );
        assert!(matches!(
            missing_bbox,
            Err(Error::MissingToken { token: BBOX_TOKEN, .. })
        ));

        let missing_id = LayerQuery::custom(
            "roads",
            "SELECT ST_AsBinary(geom) AS geom FROM roads WHERE geom && !BBOX!",
            "geom",
            Some("gid"),
            WEB_MERCATOR,
            ProviderKind::Standard,
        );
        assert!(matches!(missing_id, Err(Error::MissingField { field, .. }) if field == "gid"));

        let wildcard = LayerQuery::custom(
            "roads",
            "SELECT * FROM roads WHERE the_geom && !BBOX!",
            "geom",
            Some("gid"),
            WEB_MERCATOR,
            ProviderKind::Standard,
        );
        assert!(wildcard.is_ok());
    }

    #[test]
    fn test_generated_table_query() {
        let query = LayerQuery::table(
            "public.roads",
            &fields(&["name", "geom", "name"]),
            "geom",
            Some("gid"),
            WEB_MERCATOR,
            ProviderKind::Standard,
        );

        assert_eq!(
            "SELECT \"name\", \"gid\", ST_AsBinary(\"geom\") AS \"geom\" FROM public.roads WHERE \"geom\" && !BBOX!",
            query.to_string()
        );
        assert_eq!(fields(&["name"]), query.tag_fields);
        assert_eq!(&QuerySource::Table("public.roads".into()), query.source());
    }

    #[test]
    fn test_generated_native_tile_query() {
        let query = LayerQuery::table(
            "roads",
            &fields(&["gid"]),
            "geom",
            Some("gid"),
            WGS84,
            ProviderKind::NativeTile,
        );

        assert_eq!(
            "SELECT \"gid\", ST_AsMVTGeom(ST_Transform(\"geom\", 3857), ST_Transform(!BBOX_NOBUFFER!, 3857), 4096, 64, true) AS \"geom\" FROM roads WHERE \"geom\" && !BBOX!",
            query.to_string()
        );
        assert_eq!(true, query.tag_fields.is_empty());
    }

    #[test]
    fn test_probe_queries_on_tables() {
        let query = LayerQuery::table(
            "roads",
            &[],
            "geom",
            Some("gid"),
            WEB_MERCATOR,
            ProviderKind::Standard,
        );
        let tile = TileRequest::new(0, 0, 0, 64, WEB_MERCATOR);
        let bbox = envelope_sql(&tile.buffered_bounds(), WEB_MERCATOR);

        assert_eq!(
            format!("SELECT ST_GeometryType(\"geom\") FROM roads WHERE \"geom\" && {bbox} AND \"geom\" IS NOT NULL LIMIT 1"),
            query.probe(Probe::GeometryType, &tile)
        );
        assert_eq!(
            format!("SELECT CAST(ST_Extent(ST_Transform(\"geom\", 4326)) AS text) FROM roads WHERE \"geom\" && {bbox}"),
            query.probe(Probe::Extent, &tile)
        );
        assert_eq!(
            format!("SELECT COUNT(*) FROM roads WHERE \"geom\" && {bbox}"),
            query.probe(Probe::Count, &tile)
        );
    }

    #[test]
    fn test_probe_queries_wrap_custom_sql() {
        let query = LayerQuery::custom(
            "roads",
            "SELECT gid, ST_AsBinary(geom) AS geom FROM roads WHERE geom && !BBOX! AND z = !ZOOM!",
            "geom",
            Some("gid"),
            WEB_MERCATOR,
            ProviderKind::Standard,
        )
        .unwrap();
        let tile = TileRequest::web_mercator(0, 0, 0);
        let sql = query.probe(Probe::GeometryType, &tile);

        assert_eq!(
            sql.starts_with("SELECT ST_GeometryType(ST_GeomFromWKB(q.\"geom\", 3857)) FROM (SELECT gid"),
            true
        );
        assert_eq!(sql.contains("z IN (0,1,2"), true);
        assert_eq!(
            sql.ends_with(") AS q WHERE ST_GeomFromWKB(q.\"geom\", 3857) IS NOT NULL LIMIT 1"),
            true
        );
    }

    #[test]
    fn test_is_select_query() {
        assert_eq!(true, is_select_query("SELECT * FROM a").unwrap());
        assert_eq!(true, is_select_query("  select gid FROM a").unwrap());
        assert_eq!(
            true,
            is_select_query("-- roads by class\n  SELECT gid FROM a").unwrap()
        );
        assert_eq!(false, is_select_query("public.roads").unwrap());
        assert_eq!(
            false,
            is_select_query("(SELECT * FROM roads) AS r").unwrap()
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!("\"we\"\"ird\"", quote_ident("we\"ird"));
        assert_eq!("'it''s'", quote_literal("it's"));
    }
}
