use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::auth::FlowCancelled;

/// How long a connected peer may take to deliver the rest of its request.
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Single-shot HTTP listener for the OAuth2 loopback redirect. Bound to
/// localhost for the duration of one sign-in flow, then dropped.
pub struct LoopbackServer {
    success_template: String,
    error_template: String,
    listener: TcpListener,
}

impl LoopbackServer {
    /// Binds the listener. Port 0 picks an ephemeral port; read it back with
    /// [`LoopbackServer::port`] to build the redirect URI.
    pub fn new(port: u16, success_template: String, error_template: String) -> Result<Self> {
        let listener = TcpListener::bind(("localhost", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            success_template,
            error_template,
            listener,
        })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Waits for the browser to deliver the authorization code, answering the
    /// redirect with the success or error page. Gives up after `timeout` with
    /// a [`FlowCancelled`] error.
    pub fn listen_for_code(self, timeout: Duration, state: &str) -> Result<String> {
        let started = Instant::now();
        let mut last_hint = Instant::now();
        let hint_interval = Duration::from_secs(30);

        loop {
            if started.elapsed() > timeout {
                tracing::info!(
                    "no redirect within {timeout:?}; treating the sign-in as abandoned"
                );
                return Err(FlowCancelled.into());
            }

            if last_hint.elapsed() > hint_interval {
                tracing::info!("still waiting for the browser to return the authorization code");
                last_hint = Instant::now();
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!("redirect connection from {addr}");
                    return self.handle_stream(stream, state);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(e).context("accepting the loopback redirect connection");
                }
            }
        }
    }

    fn handle_stream(&self, mut stream: TcpStream, state: &str) -> Result<String> {
        // The listener polls nonblocking, but the single redirect request is
        // easiest read as a plain blocking stream with a deadline.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(BODY_READ_TIMEOUT))?;

        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line)? == 0 {
            anyhow::bail!("redirect connection closed before sending a request");
        }
        tracing::trace!("redirect request: {}", request_line.trim_end());

        let mut header_lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
            while line.ends_with(['\r', '\n']) {
                line.pop();
            }
            header_lines.push(line);
        }

        let content_length = header_lines
            .iter()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>())
            })
            .transpose()
            .context("invalid Content-Length in the redirect request")?
            .unwrap_or(0);

        let mut body = vec![0; content_length];
        reader
            .read_exact(&mut body)
            .context("reading the redirect body")?;
        let body = String::from_utf8_lossy(&body);
        let code_result = parse_form_response(&body, state);

        let (status, page) = match &code_result {
            Ok(_) => ("200 OK", &self.success_template),
            Err(_) => ("400 Bad Request", &self.error_template),
        };
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: text/html\r\n\r\n{page}",
            page.len(),
        );
        stream.write_all(response.as_bytes())?;
        stream.flush()?;
        stream.shutdown(std::net::Shutdown::Both)?;
        code_result
    }
}

/// Pulls the authorization code out of the form body AAD POSTs back
/// (`response_mode=form_post`), verifying the CSRF state.
fn parse_form_response(body: &str, expected_state: &str) -> Result<String> {
    let form: HashMap<&str, &str> = body
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();

    if let Some(code) = form.get("code") {
        let Some(state) = form.get("state") else {
            anyhow::bail!("authorization response carried no state");
        };
        if *state != expected_state {
            anyhow::bail!("authorization response state mismatch");
        }
        return Ok((*code).to_string());
    }

    match form.get("error").copied() {
        // The user backed out of the account picker or consent page.
        Some("access_denied") => Err(FlowCancelled.into()),
        Some(error) => {
            let description = form.get("error_description").copied().unwrap_or_default();
            anyhow::bail!("authorization endpoint returned {error}: {description}");
        }
        None => anyhow::bail!("authorization response carried neither code nor error"),
    }
}
