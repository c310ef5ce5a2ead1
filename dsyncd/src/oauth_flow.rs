use std::io::{BufRead, Write};

use dsync_core::{OAuthClient, OAuthToken};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OAuthFlowError {
    #[error("oauth error: {0}")]
    OAuth(#[from] dsync_core::OAuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authorization code missing")]
    MissingCode,
}

/// Terminal authorization: print the authorize URL, read back the code the
/// user copied from the browser, trade it for an access token.
pub struct OAuthFlow {
    client: OAuthClient,
}

impl OAuthFlow {
    pub fn new(client: OAuthClient) -> Self {
        Self { client }
    }

    pub fn prompt_code<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<String, OAuthFlowError> {
        let url = self.client.authorize_url(None)?;
        writeln!(output, "1. Go to: {url}")?;
        writeln!(output, "2. Click \"Allow\" (you might have to log in first).")?;
        write!(output, "3. Copy the authorization code and paste it here: ")?;
        output.flush()?;

        let mut line = String::new();
        input.read_line(&mut line)?;
        let code = line.trim();
        if code.is_empty() {
            return Err(OAuthFlowError::MissingCode);
        }
        Ok(code.to_string())
    }

    pub async fn exchange(&self, code: &str) -> Result<OAuthToken, OAuthFlowError> {
        Ok(self.client.exchange_code(code).await?)
    }
}
