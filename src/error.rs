use crate::geometry::WkbError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider {0} already exists")]
    DuplicateDriver(String),

    #[error("provider {0} was registered without a constructor")]
    InvalidConstructor(String),

    #[error("unknown provider {name:?}, known providers: {}", known.join(", "))]
    UnknownDriver { name: String, known: Vec<String> },

    #[error("no provider capability available")]
    NoCapability,

    #[error("invalid provider configuration: {0}")]
    Config(String),

    #[error("invalid ssl_mode ({0})")]
    InvalidSslMode(String),

    #[error("tls configuration: {0}")]
    Tls(String),

    #[error("layer {0} is duplicated")]
    DuplicateLayer(String),

    #[error("for layer {layer}: geometry_fieldname and id_fieldname are both {field:?}")]
    FieldCollision { layer: String, field: String },

    #[error("SQL for layer ({layer}) is missing required token: {token}")]
    MissingToken { layer: String, token: &'static str },

    #[error("SQL for layer ({layer}) does not contain the field: {field}")]
    MissingField { layer: String, field: String },

    #[error("layer ({layer}) returned unsupported geometry type ({name})")]
    UnsupportedGeometryType { layer: String, name: String },

    #[error("layer ({layer}) probe query returned no rows")]
    NoRows { layer: String },

    #[error("layer ({layer}) extent could not be parsed from {value:?}")]
    ExtentParse { layer: String, value: String },

    #[error("layer ({layer}) min zoom {min} is greater than max zoom {max}")]
    InvalidZoomRange { layer: String, min: u32, max: u32 },

    #[error("layer ({layer}) uses SRID {srid}, only 3857 and 4326 are supported")]
    UnsupportedSrid { layer: String, srid: u32 },

    #[error("layer ({layer}) table ({table}) is not a feature table")]
    NotFeatureTable { layer: String, table: String },

    #[error("layer ({0}) not found")]
    LayerNotFound(String),

    #[error("geometry field ({field}) not found in result set of layer ({layer})")]
    GeometryFieldMissing { layer: String, field: String },

    #[error("column ({column}) of layer ({layer}) has unexpected type {found}")]
    UnexpectedType {
        layer: String,
        column: String,
        found: String,
    },

    #[error("unable to convert feature id: {0}")]
    FeatureId(String),

    #[error("unable to decode layer ({layer}) geometry field ({field}): {source}")]
    Geometry {
        layer: String,
        field: String,
        #[source]
        source: WkbError,
    },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Callback(Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}
