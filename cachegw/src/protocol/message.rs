// (c) 2025 The cachegw authors

//! Typed request messages and their dispatch/response behavior
//!
//! A parsed [`Frame`] is promoted to a [`Request`] (validating mandatory
//! fields), dispatched against the session's [`Backend`], and the resulting
//! [`Response`] is serialized back. Get success responses defer the Value
//! field to [`Serializer::finalize_streaming`] so the object payload flows
//! from the backend reader to the socket without landing in memory.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::frame::Frame;
use super::serializer::Serializer;
use super::{msg_type, tags, StatusCode, FLAG_OVERWRITE, PROTOCOL_VERSION};
use crate::backend::{Backend, BackendFailure, ByteStream, DIGEST_MIN_KEY_LEN};

/// Session parameters the daemon is prepared to accept in a Setup exchange.
#[derive(Clone, Copy, Debug)]
pub struct SetupParams {
    pub version: u8,
    pub buffer_size: u32,
    pub operation_timeout_ms: u32,
}

/// A request that failed validation before dispatch.
///
/// These answer with an `ERROR` status; the connection stays open.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message type {0:#06x} is not protocol coherent")]
    UnknownType(u16),
    #[error("{message} request is missing its {name} field")]
    MissingField {
        message: &'static str,
        name: &'static str,
    },
}

/// A validated request. Key and value payloads borrow from the receive
/// buffer; nothing is copied on the way in.
#[derive(Debug)]
pub enum Request<'a> {
    Setup(Setup),
    Get(Get<'a>),
    Put(Put<'a>),
    Delete(Delete<'a>),
}

/// Setup request: the client proposes session parameters.
#[derive(Debug, Default)]
pub struct Setup {
    proposed_version: Option<u8>,
    proposed_buffer_size: Option<u32>,
    proposed_operation_timeout: Option<u32>,
}

#[derive(Debug)]
pub struct Get<'a> {
    key: &'a [u8],
}

#[derive(Debug)]
pub struct Put<'a> {
    key: &'a [u8],
    value: &'a [u8],
    only_if_missing: bool,
}

#[derive(Debug)]
pub struct Delete<'a> {
    key: &'a [u8],
}

/// A parameter echoed back in a Setup REDIRECT.
#[derive(Debug, Eq, PartialEq)]
pub enum Renegotiation {
    Version(u8),
    BufferSize(u32),
    OperationTimeout(u32),
}

/// Everything needed to serialize one response.
pub struct Response {
    pub status: StatusCode,
    /// Diagnostic carried in an ErrorMessage field on error statuses.
    pub error: Option<String>,
    /// Streamed Value payload for Get successes.
    pub value: Option<(ByteStream, u64)>,
    /// Acceptable parameters echoed on Setup REDIRECT.
    pub renegotiate: Vec<Renegotiation>,
}

impl Response {
    fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            error: None,
            value: None,
            renegotiate: Vec::new(),
        }
    }

    fn from_failure(backend: &dyn Backend, failure: &BackendFailure) -> Self {
        let status = backend.resolve_protocol_code(failure.code);
        let mut response = Self::with_status(status);
        if matches!(status, StatusCode::Error | StatusCode::LocalError) {
            response.error = Some(failure.message.clone());
        }
        response
    }

    fn field_count(&self) -> u8 {
        let mut count = 1usize; // StatusCode is always present
        count += usize::from(self.value.is_some());
        count += usize::from(self.error.is_some());
        count += self.renegotiate.len();
        u8::try_from(count).unwrap_or(u8::MAX)
    }

    /// Serializes this response and writes it to `sink`.
    ///
    /// Streamed values are emitted after the fixed fields: status first,
    /// then the Value header, then payload bytes, in that total order.
    /// The serializer is left reset.
    pub async fn write<W>(
        mut self,
        response_type: u16,
        serializer: &mut Serializer,
        sink: &mut W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        serializer.begin_message(PROTOCOL_VERSION, self.field_count(), response_type)?;
        serializer.add_u8_field(tags::STATUS_CODE, self.status.into())?;
        for parameter in &self.renegotiate {
            match parameter {
                Renegotiation::Version(v) => {
                    serializer.add_u8_field(tags::SETUP_VERSION, *v)?;
                }
                Renegotiation::BufferSize(size) => {
                    serializer.add_u32_field(tags::SETUP_BUFFER_SIZE, *size)?;
                }
                Renegotiation::OperationTimeout(ms) => {
                    serializer.add_u32_field(tags::SETUP_OPERATION_TIMEOUT, *ms)?;
                }
            }
        }
        if let Some(message) = &self.error {
            serializer.add_field(tags::ERROR_MESSAGE, message.as_bytes())?;
        }

        if let Some((reader, size)) = self.value.take() {
            serializer.finalize_streaming(sink, reader, size).await?;
        } else {
            sink.write_all(serializer.bytes()).await?;
            sink.flush().await?;
            serializer.reset();
        }
        Ok(())
    }
}

impl<'a> Request<'a> {
    /// Promotes a parsed frame to a typed request, validating mandatory
    /// fields per message type.
    pub fn from_frame(frame: &Frame<'a>) -> Result<Request<'a>, ProtocolError> {
        match frame.msg_type {
            msg_type::SETUP => Ok(Request::Setup(Setup {
                proposed_version: frame.find_field(tags::SETUP_VERSION).and_then(|f| f.as_u8()),
                proposed_buffer_size: frame
                    .find_field(tags::SETUP_BUFFER_SIZE)
                    .and_then(|f| f.as_u32()),
                proposed_operation_timeout: frame
                    .find_field(tags::SETUP_OPERATION_TIMEOUT)
                    .and_then(|f| f.as_u32()),
            })),
            msg_type::GET => Ok(Request::Get(Get {
                key: mandatory(frame, tags::KEY, "Get", "Key")?,
            })),
            msg_type::PUT => {
                let only_if_missing = match frame.find_field(tags::FLAGS).and_then(|f| f.as_u8()) {
                    Some(flags) => flags & FLAG_OVERWRITE == 0,
                    None => true,
                };
                Ok(Request::Put(Put {
                    key: mandatory(frame, tags::KEY, "Put", "Key")?,
                    value: mandatory(frame, tags::VALUE, "Put", "Value")?,
                    only_if_missing,
                }))
            }
            msg_type::DELETE => Ok(Request::Delete(Delete {
                key: mandatory(frame, tags::KEY, "Delete", "Key")?,
            })),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    /// The response discriminant: request type with bit 15 set.
    #[must_use]
    pub fn response_type(&self) -> u16 {
        let request_type = match self {
            Request::Setup(_) => msg_type::SETUP,
            Request::Get(_) => msg_type::GET,
            Request::Put(_) => msg_type::PUT,
            Request::Delete(_) => msg_type::DELETE,
        };
        request_type | msg_type::RESPONSE_BIT
    }

    /// Routes the request through the backend and produces its response.
    pub async fn dispatch(self, backend: &dyn Backend, accepted: &SetupParams) -> Response {
        match self {
            Request::Setup(setup) => setup.negotiate(accepted),
            Request::Get(get) => match checked_key(backend, get.key) {
                Err(response) => response,
                Ok(()) => match backend.get(get.key).await {
                    Ok((reader, size)) => {
                        debug!("get hit: {size} bytes");
                        let mut response = Response::with_status(StatusCode::Success);
                        response.value = Some((reader, size));
                        response
                    }
                    Err(failure) => {
                        debug!("get failed: {failure}");
                        Response::from_failure(backend, &failure)
                    }
                },
            },
            Request::Put(put) => match checked_key(backend, put.key) {
                Err(response) => response,
                Ok(()) => match backend.put(put.key, put.value, put.only_if_missing).await {
                    Ok(stored) => {
                        debug!("put complete (stored: {stored})");
                        Response::with_status(StatusCode::Success)
                    }
                    Err(failure) => {
                        debug!("put failed: {failure}");
                        Response::from_failure(backend, &failure)
                    }
                },
            },
            Request::Delete(delete) => match checked_key(backend, delete.key) {
                Err(response) => response,
                Ok(()) => match backend.remove(delete.key).await {
                    Ok(_) => Response::with_status(StatusCode::Success),
                    Err(failure) => {
                        debug!("delete failed: {failure}");
                        Response::from_failure(backend, &failure)
                    }
                },
            },
        }
    }
}

/// Digest formatting needs two key bytes; shorter keys fail here, before
/// any backend traffic.
fn checked_key(backend: &dyn Backend, key: &[u8]) -> Result<(), Response> {
    if key.len() < DIGEST_MIN_KEY_LEN {
        let failure = BackendFailure::local(format!(
            "cache key must be at least {DIGEST_MIN_KEY_LEN} bytes, got {}",
            key.len()
        ));
        return Err(Response::from_failure(backend, &failure));
    }
    Ok(())
}

fn mandatory<'a>(
    frame: &Frame<'a>,
    tag: u8,
    message: &'static str,
    name: &'static str,
) -> Result<&'a [u8], ProtocolError> {
    frame
        .find_field(tag)
        .map(|f| f.data)
        .ok_or(ProtocolError::MissingField { message, name })
}

impl Setup {
    /// Inspects each proposed parameter; anything out-of-band yields a
    /// REDIRECT echoing the acceptable value under the proposing tag.
    fn negotiate(&self, accepted: &SetupParams) -> Response {
        let mut renegotiate = Vec::new();
        if self
            .proposed_version
            .is_some_and(|v| v != accepted.version)
        {
            renegotiate.push(Renegotiation::Version(accepted.version));
        }
        if self
            .proposed_buffer_size
            .is_some_and(|size| size != accepted.buffer_size)
        {
            renegotiate.push(Renegotiation::BufferSize(accepted.buffer_size));
        }
        if self
            .proposed_operation_timeout
            .is_some_and(|ms| ms != accepted.operation_timeout_ms)
        {
            renegotiate.push(Renegotiation::OperationTimeout(
                accepted.operation_timeout_ms,
            ));
        }

        if renegotiate.is_empty() {
            Response::with_status(StatusCode::Success)
        } else {
            debug!("setup renegotiation required: {renegotiate:?}");
            let mut response = Response::with_status(StatusCode::Redirect);
            response.renegotiate = renegotiate;
            response
        }
    }
}

/// Answers a request that could not be promoted to a [`Request`]: status
/// `ERROR` plus a diagnostic, under the received type with bit 15 set.
pub async fn write_protocol_error<W>(
    error: &ProtocolError,
    received_type: u16,
    serializer: &mut Serializer,
    sink: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = Response::with_status(StatusCode::Error);
    response.error = Some(error.to_string());
    response
        .write(received_type | msg_type::RESPONSE_BIT, serializer, sink)
        .await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::Frame;
    use super::*;
    use crate::backend::ByteStream;

    /// Scripted backend: pre-programmed results, records what was called.
    #[derive(Default)]
    struct ScriptedBackend {
        get_data: Option<Vec<u8>>,
        get_failure: Option<u16>,
        put_failure: Option<u16>,
        head_finds_object: bool,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Backend for ScriptedBackend {
        async fn get(&self, _key: &[u8]) -> Result<(ByteStream, u64), BackendFailure> {
            self.record("get");
            if let Some(code) = self.get_failure {
                return Err(BackendFailure::new(code, "scripted failure"));
            }
            let data = self.get_data.clone().unwrap_or_default();
            let size = data.len() as u64;
            Ok((Box::new(std::io::Cursor::new(data)), size))
        }

        async fn put(
            &self,
            _key: &[u8],
            _value: &[u8],
            only_if_missing: bool,
        ) -> Result<bool, BackendFailure> {
            if let Some(code) = self.put_failure {
                self.record("put");
                return Err(BackendFailure::new(code, "scripted failure"));
            }
            if only_if_missing && self.head_finds_object {
                self.record("head");
                return Ok(false);
            }
            self.record("put");
            Ok(true)
        }

        async fn remove(&self, _key: &[u8]) -> Result<bool, BackendFailure> {
            self.record("remove");
            Ok(true)
        }
    }

    const PARAMS: SetupParams = SetupParams {
        version: 1,
        buffer_size: 8192,
        operation_timeout_ms: 10_000,
    };

    async fn respond(request_bytes: &[u8], backend: &ScriptedBackend) -> Vec<u8> {
        let frame = Frame::parse(request_bytes).unwrap();
        let request = Request::from_frame(&frame).unwrap();
        let response_type = request.response_type();
        let response = request.dispatch(backend, &PARAMS).await;
        let mut serializer = Serializer::new();
        let mut sink = Vec::new();
        response
            .write(response_type, &mut serializer, &mut sink)
            .await
            .unwrap();
        sink
    }

    #[tokio::test]
    async fn get_hit_streams_value() {
        let backend = ScriptedBackend {
            get_data: Some(b"test data".to_vec()),
            ..Default::default()
        };
        let request = [0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB];
        let response = respond(&request, &backend).await;

        let mut expected = vec![
            0x01, 0x02, 0x02, 0x80, // header: version, 2 fields, type 0x8002
            0x84, 0x01, 0x04, // StatusCode = Success
            0x82, 0x09, // Value, 9 bytes
        ];
        expected.extend_from_slice(b"test data");
        assert_eq!(response, expected);
    }

    #[tokio::test]
    async fn get_miss_reports_no_file() {
        let backend = ScriptedBackend {
            get_failure: Some(404),
            ..Default::default()
        };
        let request = [0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB];
        let response = respond(&request, &backend).await;
        assert_eq!(response, [0x01, 0x01, 0x02, 0x80, 0x84, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn put_only_if_missing_skips_existing_object() {
        let backend = ScriptedBackend {
            head_finds_object: true,
            ..Default::default()
        };
        // Key + Value, no Flags: only-if-missing is the default.
        let request = [
            0x01, 0x02, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB, 0x82, 0x03, 0x01, 0x02, 0x03,
        ];
        let response = respond(&request, &backend).await;
        assert_eq!(response, [0x01, 0x01, 0x03, 0x80, 0x84, 0x01, 0x04]);
        assert_eq!(backend.calls(), ["head"]);
    }

    #[tokio::test]
    async fn put_with_overwrite_flag_stores_unconditionally() {
        let backend = ScriptedBackend {
            head_finds_object: true,
            ..Default::default()
        };
        let request = [
            0x01, 0x03, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB, 0x82, 0x03, 0x01, 0x02, 0x03, 0x86,
            0x01, 0x01,
        ];
        let response = respond(&request, &backend).await;
        assert_eq!(response, [0x01, 0x01, 0x03, 0x80, 0x84, 0x01, 0x04]);
        assert_eq!(backend.calls(), ["put"]);
    }

    #[tokio::test]
    async fn delete_resolves_to_success() {
        let backend = ScriptedBackend::default();
        let request = [0x01, 0x01, 0x04, 0x00, 0x81, 0x02, 0xAA, 0xBB];
        let response = respond(&request, &backend).await;
        assert_eq!(response, [0x01, 0x01, 0x04, 0x80, 0x84, 0x01, 0x04]);
        assert_eq!(backend.calls(), ["remove"]);
    }

    #[tokio::test]
    async fn short_key_fails_before_backend_dispatch() {
        let backend = ScriptedBackend::default();
        let request = [0x01, 0x01, 0x02, 0x00, 0x81, 0x01, 0xAA];
        let response = respond(&request, &backend).await;
        // LocalError, with an ErrorMessage field; the backend saw nothing.
        let frame = Frame::parse(&response).unwrap();
        assert_eq!(
            frame.find_field(tags::STATUS_CODE).unwrap().as_u8(),
            Some(StatusCode::LocalError as u8)
        );
        assert!(frame.find_field(tags::ERROR_MESSAGE).is_some());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn backend_error_carries_message() {
        let backend = ScriptedBackend {
            put_failure: Some(500),
            ..Default::default()
        };
        let request = [
            0x01, 0x02, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB, 0x82, 0x01, 0x00,
        ];
        let response = respond(&request, &backend).await;
        let frame = Frame::parse(&response).unwrap();
        assert_eq!(
            frame.find_field(tags::STATUS_CODE).unwrap().as_u8(),
            Some(StatusCode::Error as u8)
        );
        assert_eq!(
            frame.find_field(tags::ERROR_MESSAGE).unwrap().data,
            b"scripted failure"
        );
    }

    #[tokio::test]
    async fn setup_in_band_is_success() {
        let backend = ScriptedBackend::default();
        // Proposes version 1 and the accepted buffer size.
        let mut serializer = Serializer::new();
        serializer.begin_message(1, 2, msg_type::SETUP).unwrap();
        serializer.add_u8_field(tags::SETUP_VERSION, 1).unwrap();
        serializer
            .add_u32_field(tags::SETUP_BUFFER_SIZE, PARAMS.buffer_size)
            .unwrap();
        let request = serializer.bytes().to_vec();

        let response = respond(&request, &backend).await;
        assert_eq!(response, [0x01, 0x01, 0x01, 0x80, 0x84, 0x01, 0x04]);
    }

    #[tokio::test]
    async fn setup_out_of_band_redirects_with_echo() {
        let backend = ScriptedBackend::default();
        let mut serializer = Serializer::new();
        serializer.begin_message(1, 2, msg_type::SETUP).unwrap();
        serializer.add_u8_field(tags::SETUP_VERSION, 2).unwrap();
        serializer.add_u32_field(tags::SETUP_BUFFER_SIZE, 65536).unwrap();
        let request = serializer.bytes().to_vec();

        let response = respond(&request, &backend).await;
        let frame = Frame::parse(&response).unwrap();
        assert_eq!(frame.msg_type, msg_type::SETUP | msg_type::RESPONSE_BIT);
        assert_eq!(
            frame.find_field(tags::STATUS_CODE).unwrap().as_u8(),
            Some(StatusCode::Redirect as u8)
        );
        assert_eq!(
            frame.find_field(tags::SETUP_VERSION).unwrap().as_u8(),
            Some(PARAMS.version)
        );
        assert_eq!(
            frame.find_field(tags::SETUP_BUFFER_SIZE).unwrap().as_u32(),
            Some(PARAMS.buffer_size)
        );
    }

    #[tokio::test]
    async fn empty_setup_is_success() {
        let backend = ScriptedBackend::default();
        let request = [0x01, 0x00, 0x01, 0x00];
        let response = respond(&request, &backend).await;
        assert_eq!(response, [0x01, 0x01, 0x01, 0x80, 0x84, 0x01, 0x04]);
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let buf = [0x01, 0x00, 0x99, 0x00];
        let frame = Frame::parse(&buf).unwrap();
        assert_eq!(
            Request::from_frame(&frame).unwrap_err(),
            ProtocolError::UnknownType(0x0099)
        );
    }

    #[test]
    fn missing_mandatory_field() {
        // Get with no Key.
        let buf = [0x01, 0x00, 0x02, 0x00];
        let frame = Frame::parse(&buf).unwrap();
        assert_eq!(
            Request::from_frame(&frame).unwrap_err(),
            ProtocolError::MissingField {
                message: "Get",
                name: "Key"
            }
        );
        // Put with Key but no Value.
        let buf = [0x01, 0x01, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB];
        let frame = Frame::parse(&buf).unwrap();
        assert!(matches!(
            Request::from_frame(&frame),
            Err(ProtocolError::MissingField { name: "Value", .. })
        ));
    }

    #[tokio::test]
    async fn protocol_error_response_shape() {
        let mut serializer = Serializer::new();
        let mut sink = Vec::new();
        write_protocol_error(
            &ProtocolError::UnknownType(0x0099),
            0x0099,
            &mut serializer,
            &mut sink,
        )
        .await
        .unwrap();
        let frame = Frame::parse(&sink).unwrap();
        assert_eq!(frame.msg_type, 0x8099);
        assert_eq!(
            frame.find_field(tags::STATUS_CODE).unwrap().as_u8(),
            Some(StatusCode::Error as u8)
        );
        assert!(frame.find_field(tags::ERROR_MESSAGE).is_some());
    }

    #[test]
    fn response_types() {
        let frame_bytes = [0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB];
        let frame = Frame::parse(&frame_bytes).unwrap();
        assert_eq!(
            Request::from_frame(&frame).unwrap().response_type(),
            0x8002
        );
    }
}
