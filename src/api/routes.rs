// ABOUTME: Maps request method and path onto gateway routes.
// ABOUTME: Segments are percent-decoded; multi-segment tags are rejoined with '/'.

use hyper::Method;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Help,
    List {
        system: String,
    },
    Lookup {
        system: String,
        itype: String,
        tag: String,
    },
    Pull {
        system: String,
        itype: String,
        tag: String,
    },
    Expire {
        system: String,
        itype: String,
        tag: String,
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no such route: {0}")]
    NotFound(String),

    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed { method: Method, path: String },

    #[error("path is not valid UTF-8 after decoding: {0}")]
    BadEncoding(String),
}

impl Route {
    pub fn parse(method: &Method, path: &str) -> Result<Self, RouteError> {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .map_err(|_| RouteError::BadEncoding(path.to_string()))
            })
            .collect::<Result<Vec<String>, _>>()?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let (route, allowed) = match segments.as_slice() {
            [] => (Route::Help, Method::GET),
            ["api", "list", system] => (
                Route::List {
                    system: system.to_string(),
                },
                Method::GET,
            ),
            ["api", "lookup", system, itype, tag @ ..] if !tag.is_empty() => (
                Route::Lookup {
                    system: system.to_string(),
                    itype: itype.to_string(),
                    tag: tag.join("/"),
                },
                Method::GET,
            ),
            ["api", "pull", system, itype, tag @ ..] if !tag.is_empty() => (
                Route::Pull {
                    system: system.to_string(),
                    itype: itype.to_string(),
                    tag: tag.join("/"),
                },
                Method::POST,
            ),
            ["api", "expire", system, itype, tag @ .., id] if !tag.is_empty() => (
                Route::Expire {
                    system: system.to_string(),
                    itype: itype.to_string(),
                    tag: tag.join("/"),
                    id: id.to_string(),
                },
                Method::GET,
            ),
            _ => return Err(RouteError::NotFound(path.to_string())),
        };

        if *method != allowed {
            return Err(RouteError::MethodNotAllowed {
                method: method.clone(),
                path: path.to_string(),
            });
        }
        Ok(route)
    }
}
