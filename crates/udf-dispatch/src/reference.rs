//! Run requests and the legacy calling conventions they still accept.

use serde_json::{Map, Value};
use udf_core::{is_sha256_hex, DispatchError, Engine, JobStep, Mode, Shape, Source, UdfDefinition};

use crate::warn;

const TOKEN_DEPRECATED: &str = "The 'token' keyword is deprecated. You can pass the token as the first argument instead.";
const TOKEN_IGNORED: &str =
    "token parameter is being ignored in favor of the first positional parameter.";
const EMAIL_NAME_DEPRECATED: &str = "The 'udf_email' and 'udf_name' keywords are deprecated. You can pass the email and name as the first argument instead (\"<email>/<name>\").";
const EMAIL_IGNORED: &str =
    "udf_email parameter is being ignored in favor of the first positional parameter.";
const POSITIONAL_NAME_DEPRECATED: &str = "The separate 'udf_email' and 'udf_name' arguments are deprecated. You can pass the email and name as the first argument instead (\"<email>/<name>\").";

/// Whether `s` looks like an opaque share token rather than a definition name.
pub fn is_udf_token(s: &str) -> bool {
    is_sha256_hex(s) || s.starts_with("UDF_") || s.starts_with("fsh_")
}

/// What a run request points at.
#[derive(Debug, Clone, PartialEq)]
pub enum UdfRef {
    /// Opaque share token.
    Token(String),

    /// A definition saved on the service. Without an owner, the signed-in user owns it.
    Saved { owner: Option<String>, name: String },

    JobStep(Box<JobStep>),
    Udf(Box<UdfDefinition>),
}

impl UdfRef {
    /// `owner/name`, a share token, or a bare name owned by the signed-in user.
    pub fn parse(s: &str) -> Self {
        if let Some((owner, name)) = s.split_once('/') {
            return UdfRef::Saved {
                owner: Some(owner.to_string()),
                name: name.to_string(),
            };
        }
        if !s.contains('@') && is_udf_token(s) {
            return UdfRef::Token(s.to_string());
        }
        UdfRef::Saved {
            owner: None,
            name: s.to_string(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        UdfRef::Token(token.into())
    }

    pub fn saved(owner: impl Into<String>, name: impl Into<String>) -> Self {
        UdfRef::Saved {
            owner: Some(owner.into()),
            name: name.into(),
        }
    }

    pub fn source(&self) -> Source {
        match self {
            UdfRef::Token(_) => Source::Token,
            UdfRef::Saved { .. } => Source::Saved,
            UdfRef::JobStep(_) | UdfRef::Udf(_) => Source::Local,
        }
    }

    /// The in-memory job step, wrapping a bare definition if needed.
    pub fn into_job_step(self) -> Option<JobStep> {
        match self {
            UdfRef::JobStep(step) => Some(*step),
            UdfRef::Udf(udf) => Some(JobStep::new(*udf)),
            UdfRef::Token(_) | UdfRef::Saved { .. } => None,
        }
    }
}

impl From<&str> for UdfRef {
    fn from(s: &str) -> Self {
        UdfRef::parse(s)
    }
}

impl From<String> for UdfRef {
    fn from(s: String) -> Self {
        UdfRef::parse(&s)
    }
}

impl From<UdfDefinition> for UdfRef {
    fn from(udf: UdfDefinition) -> Self {
        UdfRef::Udf(Box::new(udf))
    }
}

impl From<JobStep> for UdfRef {
    fn from(step: JobStep) -> Self {
        UdfRef::JobStep(Box::new(step))
    }
}

/// One logical "run a unit of work" request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub udf: Option<UdfRef>,

    /// Positional arguments after the reference. One is accepted: the definition name, with the
    /// reference naming its owner.
    pub args: Vec<String>,

    /// Legacy `token=` keyword.
    pub token: Option<String>,

    /// Legacy `udf_email=` + `udf_name=` keywords.
    pub udf_email: Option<String>,
    pub udf_name: Option<String>,

    pub x: Option<u32>,
    pub y: Option<u32>,
    pub z: Option<u32>,

    pub shape: Option<Shape>,
    pub engine: Option<Engine>,
    pub mode: Mode,

    pub parameters: Map<String, Value>,

    /// Return the full execution result instead of its data.
    pub include_log: bool,

    /// Normalize and check the output of local executions.
    pub validate_output: bool,

    pub validate_imports: Option<bool>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            udf: None,
            args: Vec::new(),
            token: None,
            udf_email: None,
            udf_name: None,
            x: None,
            y: None,
            z: None,
            shape: None,
            engine: None,
            mode: Mode::Sync,
            parameters: Map::new(),
            include_log: false,
            validate_output: false,
            validate_imports: None,
        }
    }
}

impl RunRequest {
    pub fn new(udf: impl Into<UdfRef>) -> Self {
        Self {
            udf: Some(udf.into()),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn legacy_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn legacy_email_name(mut self, email: impl Into<String>, name: impl Into<String>) -> Self {
        self.udf_email = Some(email.into());
        self.udf_name = Some(name.into());
        self
    }

    pub fn tile(mut self, x: u32, y: u32, z: u32) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self.z = Some(z);
        self
    }

    pub fn coordinates(mut self, x: Option<u32>, y: Option<u32>, z: Option<u32>) -> Self {
        self.x = x;
        self.y = y;
        self.z = z;
        self
    }

    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn include_log(mut self) -> Self {
        self.include_log = true;
        self
    }

    pub fn validate_output(mut self, validate: bool) -> Self {
        self.validate_output = validate;
        self
    }

    pub fn validate_imports(mut self, validate: bool) -> Self {
        self.validate_imports = Some(validate);
        self
    }

    /// Fold every accepted calling convention into one reference.
    ///
    /// Legacy forms are accepted with a deprecation warning. A legacy form that names a
    /// different unit of work than the positional reference is an error.
    pub fn resolve_reference(&mut self, warnings: &mut Vec<String>) -> Result<UdfRef, DispatchError> {
        let mut udf = self.udf.take();

        if let Some(token) = self.token.take() {
            if self.udf_email.is_some() || self.udf_name.is_some() {
                return Err(DispatchError::ConflictingReference(
                    "`token` cannot be combined with `udf_email`/`udf_name`".to_string(),
                ));
            }
            match udf.as_ref() {
                None => {}
                Some(UdfRef::Token(existing)) if *existing == token => warn(warnings, TOKEN_IGNORED),
                Some(_) => {
                    return Err(DispatchError::ConflictingReference(
                        "`token` names a different UDF than the first positional argument"
                            .to_string(),
                    ))
                }
            }
            if udf.is_none() {
                udf = Some(UdfRef::Token(token));
            }
            warn(warnings, TOKEN_DEPRECATED);
        } else if self.udf_email.is_some() || self.udf_name.is_some() {
            let (Some(email), Some(name)) = (self.udf_email.take(), self.udf_name.take()) else {
                return Err(DispatchError::InvalidArgument(
                    "`udf_email` and `udf_name` must be given together".to_string(),
                ));
            };
            let legacy = UdfRef::Saved {
                owner: Some(email),
                name,
            };
            match udf.as_ref() {
                None => warn(warnings, EMAIL_NAME_DEPRECATED),
                Some(existing) if *existing == legacy => warn(warnings, EMAIL_IGNORED),
                Some(_) => {
                    return Err(DispatchError::ConflictingReference(
                        "`udf_email`/`udf_name` name a different UDF than the first positional argument"
                            .to_string(),
                    ))
                }
            }
            if udf.is_none() {
                udf = Some(legacy);
            }
        } else if !self.args.is_empty() {
            if self.args.len() > 1 {
                return Err(DispatchError::TooManyPositional(self.args.len() + 1));
            }
            let name = self.args.remove(0);
            udf = match udf {
                Some(UdfRef::Saved { owner: None, name: owner }) => Some(UdfRef::Saved {
                    owner: Some(owner),
                    name,
                }),
                _ => {
                    return Err(DispatchError::InvalidArgument(
                        "a UDF name may only follow an owner email".to_string(),
                    ))
                }
            };
            warn(warnings, POSITIONAL_NAME_DEPRECATED);
        }

        udf.ok_or_else(|| DispatchError::InvalidArgument("No UDF specified".to_string()))
    }
}
