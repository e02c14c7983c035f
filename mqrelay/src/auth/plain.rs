use std::collections::HashMap;
use std::path::Path;

use anyhow::anyhow;
use async_trait::async_trait;

use super::{Authenticator, LoginRequest, ReturnCode};
use crate::Result;

/// Checks credentials against an in-memory table merged from the
/// configuration mapping and an optional CSV file.
pub struct PlainAuthenticator {
    credentials: HashMap<String, String>,
}

impl PlainAuthenticator {
    pub fn new(
        credentials: HashMap<String, String>,
        credentials_file: Option<&str>,
    ) -> Result<PlainAuthenticator> {
        let mut merged = credentials;
        if let Some(filename) = credentials_file {
            if !filename.is_empty() {
                let content = std::fs::read_to_string(Path::new(filename))
                    .map_err(|e| anyhow!("open credentials file '{}', {}", filename, e))?;
                merged.extend(credentials_from_csv(&content)?);
            }
        }
        Ok(PlainAuthenticator { credentials: merged })
    }
}

/// Headerless two-column CSV: `username,password`. Lines starting with `#`
/// are comments, leading whitespace in fields is trimmed, anything other
/// than exactly two fields per record is an error.
fn credentials_from_csv(content: &str) -> Result<HashMap<String, String>> {
    let mut credentials = HashMap::new();
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim_start()).collect();
        if fields.len() != 2 {
            return Err(anyhow!("csv record username,password expected but got '{}'", line));
        }
        credentials.insert(fields[0].to_string(), fields[1].to_string());
    }
    Ok(credentials)
}

#[async_trait]
impl Authenticator for PlainAuthenticator {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn login(&self, request: &LoginRequest) -> Result<ReturnCode> {
        match self.credentials.get(&request.username) {
            // an empty stored password matches nothing
            Some(password) if !password.is_empty() && *password == request.password => {
                Ok(ReturnCode::Accepted)
            }
            _ => Ok(ReturnCode::RefusedNotAuthorized),
        }
    }
}
