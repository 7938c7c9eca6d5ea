//! Consent surfaces for a terminal session.
//!
//! With a loopback redirect (`http://127.0.0.1:<port>`) the system browser
//! is opened at the consent URL and every request reaching the local
//! listener is reported as a navigation. Otherwise the URL is printed and
//! the user pastes the authorization code shown by the provider.
//!
//! The pasted code is read on a blocking thread that cannot be interrupted.
//! Callers exit the process after a cancelled sign-in instead of waiting
//! for that read to return.

use async_trait::async_trait;
use std::io::{BufRead, Write};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use lexisync_common::{Error, Result};
use lexisync_storage::{InteractiveSurface, SurfaceEvent, SurfaceHandle, SurfaceOptions};

const LANDING_PAGE: &str = "<!doctype html><html><body>\
<p>LexiSync received the authorization response. You can close this tab.</p>\
</body></html>";

/// Pick the surface matching the redirect target.
pub fn for_redirect(redirect_uri: &str) -> Box<dyn InteractiveSurface> {
    match Url::parse(redirect_uri) {
        Ok(url) if url.scheme() == "http" && is_loopback(&url) => {
            Box::new(LoopbackSurface::new(url))
        }
        _ => Box::new(PasteCodeSurface {
            redirect_uri: redirect_uri.to_string(),
        }),
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("127.0.0.1") | Some("localhost") | Some("[::1]"))
}

/// Forwards Ctrl-C as a closed surface.
fn watch_interrupt(events: mpsc::UnboundedSender<SurfaceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(SurfaceEvent::Closed);
        }
    })
}

struct TaskSurfaceHandle {
    events: mpsc::UnboundedReceiver<SurfaceEvent>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl SurfaceHandle for TaskSurfaceHandle {
    async fn next_event(&mut self) -> SurfaceEvent {
        self.events.recv().await.unwrap_or(SurfaceEvent::Closed)
    }

    async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for TaskSurfaceHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// System browser plus a local listener on the redirect port.
pub struct LoopbackSurface {
    redirect: Url,
    launch_browser: bool,
}

impl LoopbackSurface {
    pub fn new(redirect: Url) -> Self {
        Self {
            redirect,
            launch_browser: true,
        }
    }

    /// Only print the consent URL.
    pub fn without_browser(mut self) -> Self {
        self.launch_browser = false;
        self
    }
}

#[async_trait]
impl InteractiveSurface for LoopbackSurface {
    async fn open(&self, url: &str, _options: &SurfaceOptions) -> Result<Box<dyn SurfaceHandle>> {
        let host = self.redirect.host_str().unwrap_or("127.0.0.1");
        let port = self
            .redirect
            .port_or_known_default()
            .ok_or_else(|| Error::Configuration("Redirect URI has no port".to_string()))?;

        let listener = TcpListener::bind((host.trim_matches(['[', ']']), port)).await?;
        debug!("Listening for the redirect on {}:{}", host, port);

        let (tx, rx) = mpsc::unbounded_channel();
        let origin = format!("http://{}:{}", host, port);
        let listener_events = tx.clone();
        let accept = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Redirect listener failed: {}", e);
                        let _ = listener_events.send(SurfaceEvent::Closed);
                        return;
                    }
                };
                match read_request_target(stream).await {
                    Ok(Some(target)) => {
                        if listener_events
                            .send(SurfaceEvent::Navigating(format!("{}{}", origin, target)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Ignoring malformed redirect request: {}", e),
                }
            }
        });

        let launched = self.launch_browser
            && match open::that(url) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not launch a browser: {}", e);
                    false
                }
            };
        if launched {
            println!("Continue the Google sign-in in your browser.");
        } else {
            println!("Open this URL to continue:\n\n  {}\n", url);
        }

        Ok(Box::new(TaskSurfaceHandle {
            events: rx,
            tasks: vec![accept, watch_interrupt(tx)],
        }))
    }
}

/// Read the request line, answer with the landing page, return the target.
async fn read_request_target(mut stream: TcpStream) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    BufReader::new(&mut stream).read_line(&mut line).await?;

    let target = line
        .split_whitespace()
        .nth(1)
        .filter(|target| target.starts_with('/'))
        .map(str::to_string);

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        LANDING_PAGE.len(),
        LANDING_PAGE
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;

    Ok(target)
}

/// Prints the consent URL and reads the pasted authorization code.
pub struct PasteCodeSurface {
    redirect_uri: String,
}

#[async_trait]
impl InteractiveSurface for PasteCodeSurface {
    async fn open(&self, url: &str, _options: &SurfaceOptions) -> Result<Box<dyn SurfaceHandle>> {
        println!("Open this URL, approve access and paste the code shown:\n\n  {}\n", url);
        if open::that(url).is_err() {
            debug!("No browser available, waiting for a pasted code");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let redirect_uri = self.redirect_uri.clone();
        let stdin_events = tx.clone();
        let reader = tokio::spawn(async move {
            print!("Authorization code: ");
            let _ = std::io::stdout().flush();

            let read = tokio::task::spawn_blocking(move || {
                read_code_event(std::io::stdin().lock(), &redirect_uri)
            });
            let event = read.await.unwrap_or(SurfaceEvent::Closed);
            let _ = stdin_events.send(event);
        });

        Ok(Box::new(TaskSurfaceHandle {
            events: rx,
            tasks: vec![reader, watch_interrupt(tx)],
        }))
    }
}

/// One line of input: a pasted code, or nothing at all.
fn read_code_event(mut input: impl BufRead, redirect_uri: &str) -> SurfaceEvent {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(n) if n > 0 && !line.trim().is_empty() => {
            SurfaceEvent::Navigating(code_redirect(redirect_uri, line.trim()))
        }
        _ => SurfaceEvent::Closed,
    }
}

/// The redirect the provider would have issued for `code`.
fn code_redirect(redirect_uri: &str, code: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(code.as_bytes()).collect();
    format!("{}?code={}", redirect_uri, encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_redirect_is_parseable() {
        let target = code_redirect("urn:ietf:wg:oauth:2.0:oob", "4/0Ab+x y");
        let url = Url::parse(&target).unwrap();

        let code = url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned());
        assert_eq!(code.as_deref(), Some("4/0Ab+x y"));
    }

    #[test]
    fn test_read_code_event() {
        let oob = "urn:ietf:wg:oauth:2.0:oob";

        let event = read_code_event(std::io::Cursor::new("  4/0Abc \n"), oob);
        assert_eq!(
            event,
            SurfaceEvent::Navigating("urn:ietf:wg:oauth:2.0:oob?code=4%2F0Abc".to_string())
        );

        assert_eq!(read_code_event(std::io::Cursor::new(""), oob), SurfaceEvent::Closed);
        assert_eq!(read_code_event(std::io::Cursor::new("   \n"), oob), SurfaceEvent::Closed);
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback(&Url::parse("http://127.0.0.1:8765").unwrap()));
        assert!(is_loopback(&Url::parse("http://localhost:8765/cb").unwrap()));
        assert!(!is_loopback(&Url::parse("https://example.com/cb").unwrap()));
    }

    #[tokio::test]
    async fn test_loopback_reports_navigation() {
        let reserved = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let surface =
            LoopbackSurface::new(Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap())
                .without_browser();
        let mut handle = surface
            .open("http://127.0.0.1:1/unused", &SurfaceOptions::default())
            .await
            .unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET /?code=abc123&state=s HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(
            handle.next_event().await,
            SurfaceEvent::Navigating(format!("http://127.0.0.1:{}/?code=abc123&state=s", port))
        );
        handle.close().await;
    }
}
