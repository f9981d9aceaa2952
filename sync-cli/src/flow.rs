//! Console consent flow: print the authorization URL, read the redirect back.

use async_trait::async_trait;
use sync_client::{AuthorizationFlow, FlowError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;

/// Asks the user to open the authorization URL in a browser and paste the
/// URL the provider redirected to. An empty line cancels.
#[derive(Debug)]
pub struct ConsoleAuthorizationFlow<R = BufReader<Stdin>> {
    input: Mutex<R>,
}

impl ConsoleAuthorizationFlow {
    /// Flow reading from standard input.
    pub fn stdin() -> Self {
        Self::with_input(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> ConsoleAuthorizationFlow<R> {
    /// Flow reading redirects from `input`.
    pub fn with_input(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

#[async_trait]
impl<R> AuthorizationFlow for ConsoleAuthorizationFlow<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn launch(&self, authorization_url: &str) -> Result<String, FlowError> {
        eprintln!("Open this URL in your browser and approve access:");
        eprintln!();
        eprintln!("    {}", authorization_url);
        eprintln!();
        eprintln!("Then paste the URL you were redirected to (empty line cancels):");

        let mut line = String::new();
        self.input
            .lock()
            .await
            .read_line(&mut line)
            .await
            .map_err(|e| FlowError::Other(format!("cannot read redirect: {}", e)))?;

        let redirect = line.trim();
        if redirect.is_empty() {
            return Err(FlowError::Cancelled);
        }
        Ok(redirect.to_string())
    }
}
