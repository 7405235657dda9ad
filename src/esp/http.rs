use std::io;

use embedded_svc::http::client::{Client as HttpClient, Response as HttpResponse};
use embedded_svc::http::{Headers, Method as HttpMethod, Status};
use esp_idf_svc::http::client::{Configuration as HttpClientConfiguration, EspHttpConnection};
use log::debug;

use crate::transport::{Method, Request, Response, Transport, TransportError};

/// HTTP(S) over `EspHttpConnection`. Servers are verified against the
/// global CA store when one was installed, the certificate bundle otherwise.
pub struct EspTransport {
    use_global_ca: bool,
    client: Option<HttpClient<EspHttpConnection>>,
}

impl EspTransport {
    pub fn new(use_global_ca: bool) -> Self {
        Self {
            use_global_ca,
            client: None,
        }
    }
}

fn connect_error(e: impl core::fmt::Debug) -> TransportError {
    TransportError::Connect(format!("{e:?}"))
}

impl Transport for EspTransport {
    fn open(&mut self, request: &Request<'_>) -> Result<Response<'_>, TransportError> {
        let config = HttpClientConfiguration {
            timeout: Some(request.timeout),
            use_global_ca_store: self.use_global_ca,
            crt_bundle_attach: if self.use_global_ca {
                None
            } else {
                Some(esp_idf_sys::esp_crt_bundle_attach)
            },
            buffer_size: Some(4096),
            buffer_size_tx: Some(2048),
            ..Default::default()
        };
        // Timeouts are fixed per connection, so every request gets a fresh one.
        let connection = EspHttpConnection::new(&config).map_err(connect_error)?;
        let client = self.client.insert(HttpClient::wrap(connection));

        let method = match request.method {
            Method::Get => HttpMethod::Get,
            Method::Head => HttpMethod::Head,
        };
        let response = client
            .request(method, request.url, &[])
            .map_err(connect_error)?
            .submit()
            .map_err(connect_error)?;

        let status = response.status();
        let content_length = response
            .header("Content-Length")
            .or_else(|| response.header("content-length"))
            .and_then(|value| value.parse::<u64>().ok());
        debug!("HTTP {:?} answered {} ({:?} bytes)", request.method, status, content_length);

        Ok(Response {
            status,
            content_length,
            body: Box::new(BodyReader(response)),
        })
    }
}

struct BodyReader<'a>(HttpResponse<&'a mut EspHttpConnection>);

impl io::Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        embedded_svc::io::Read::read(&mut self.0, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{e:?}")))
    }
}
