//! Decoded CoAP messages

use bytes::Bytes;
use std::time::Instant;
use url::Url;

use crate::address::{format_path, parse_path};
use crate::{EndpointAddress, Error, MediaType, MessageType, Method, ResponseCode, Result};

/// Fields every message kind shares
pub trait Message {
    /// Message type, if already assigned
    fn message_type(&self) -> Option<MessageType>;

    fn mid(&self) -> Option<u16>;

    fn token(&self) -> &Bytes;

    /// Remote endpoint this message came from or goes to
    fn peer(&self) -> Option<EndpointAddress>;

    fn is_ignored(&self) -> bool;

    fn set_ignored(&mut self, ignored: bool);
}

/// A CoAP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub mtype: MessageType,
    pub mid: Option<u16>,
    pub token: Bytes,
    /// Uri-Path segments
    pub uri_path: Vec<String>,
    /// Proxy-Uri option, set on requests addressed to a proxy
    pub proxy_uri: Option<String>,
    /// Accept options in client preference order
    pub accept: Vec<MediaType>,
    /// Observe option
    pub observe: Option<u32>,
    pub payload: Bytes,
    pub source: Option<EndpointAddress>,
    pub ignored: bool,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            mtype: MessageType::Con,
            mid: None,
            token: Bytes::new(),
            uri_path: Vec::new(),
            proxy_uri: None,
            accept: Vec::new(),
            observe: None,
            payload: Bytes::new(),
            source: None,
            ignored: false,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::Get)
    }

    pub fn post() -> Self {
        Self::new(Method::Post)
    }

    pub fn put() -> Self {
        Self::new(Method::Put)
    }

    pub fn delete() -> Self {
        Self::new(Method::Delete)
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.uri_path = parse_path(path);
        self
    }

    pub fn with_proxy_uri(mut self, uri: impl Into<String>) -> Self {
        self.proxy_uri = Some(uri.into());
        self
    }

    pub fn with_accept(mut self, media: MediaType) -> Self {
        self.accept.push(media);
        self
    }

    pub fn with_observe(mut self, observe: u32) -> Self {
        self.observe = Some(observe);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_source(mut self, source: EndpointAddress) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_type(mut self, mtype: MessageType) -> Self {
        self.mtype = mtype;
        self
    }

    pub fn with_mid(mut self, mid: u16) -> Self {
        self.mid = Some(mid);
        self
    }

    pub fn with_token(mut self, token: impl Into<Bytes>) -> Self {
        self.token = token.into();
        self
    }

    pub fn path(&self) -> String {
        format_path(&self.uri_path)
    }

    pub fn has_observe(&self) -> bool {
        self.observe.is_some()
    }

    /// Normalized Proxy-Uri used to identify the proxied target
    pub fn proxy_target(&self) -> Result<String> {
        let raw = self
            .proxy_uri
            .as_deref()
            .ok_or_else(|| Error::InvalidUri("request has no proxy uri".to_string()))?;
        let url = Url::parse(raw)?;
        Ok(url.to_string())
    }
}

impl Message for Request {
    fn message_type(&self) -> Option<MessageType> {
        Some(self.mtype)
    }

    fn mid(&self) -> Option<u16> {
        self.mid
    }

    fn token(&self) -> &Bytes {
        &self.token
    }

    fn peer(&self) -> Option<EndpointAddress> {
        self.source
    }

    fn is_ignored(&self) -> bool {
        self.ignored
    }

    fn set_ignored(&mut self, ignored: bool) {
        self.ignored = ignored;
    }
}

/// A CoAP response
#[derive(Debug, Clone)]
pub struct Response {
    pub code: ResponseCode,
    /// Assigned by the reliability layer; `None` until then
    pub mtype: Option<MessageType>,
    pub mid: Option<u16>,
    pub token: Bytes,
    pub content_format: Option<MediaType>,
    /// Max-Age option (seconds)
    pub max_age: Option<u32>,
    /// Observe sequence number of a notification
    pub observe: Option<u32>,
    pub payload: Bytes,
    pub destination: Option<EndpointAddress>,
    /// Monotonic arrival/creation time
    pub timestamp: Instant,
    pub ignored: bool,
}

impl Response {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            mtype: None,
            mid: None,
            token: Bytes::new(),
            content_format: None,
            max_age: None,
            observe: None,
            payload: Bytes::new(),
            destination: None,
            timestamp: Instant::now(),
            ignored: false,
        }
    }

    /// Response with a text/plain body
    pub fn text(code: ResponseCode, body: impl Into<String>) -> Self {
        Self::new(code)
            .with_payload(body.into())
            .with_content_format(MediaType::TEXT_PLAIN)
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_content_format(mut self, media: MediaType) -> Self {
        self.content_format = Some(media);
        self
    }

    pub fn with_max_age(mut self, max_age: u32) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_type(mut self, mtype: MessageType) -> Self {
        self.mtype = Some(mtype);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Payload as UTF-8, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl Message for Response {
    fn message_type(&self) -> Option<MessageType> {
        self.mtype
    }

    fn mid(&self) -> Option<u16> {
        self.mid
    }

    fn token(&self) -> &Bytes {
        &self.token
    }

    fn peer(&self) -> Option<EndpointAddress> {
        self.destination
    }

    fn is_ignored(&self) -> bool {
        self.ignored
    }

    fn set_ignored(&mut self, ignored: bool) {
        self.ignored = ignored;
    }
}

/// Message without code or payload: ACK, RST or ping
#[derive(Debug, Clone)]
pub struct EmptyMessage {
    pub mtype: MessageType,
    pub mid: Option<u16>,
    pub token: Bytes,
    pub destination: Option<EndpointAddress>,
    pub ignored: bool,
}

impl EmptyMessage {
    pub fn new(mtype: MessageType) -> Self {
        Self {
            mtype,
            mid: None,
            token: Bytes::new(),
            destination: None,
            ignored: false,
        }
    }

    /// Reset matching the given message
    pub fn reset_for(message: &dyn Message) -> Self {
        Self::reply_to(MessageType::Rst, message)
    }

    /// Empty acknowledgement matching the given message
    pub fn ack_for(message: &dyn Message) -> Self {
        Self::reply_to(MessageType::Ack, message)
    }

    fn reply_to(mtype: MessageType, message: &dyn Message) -> Self {
        Self {
            mtype,
            mid: message.mid(),
            token: Bytes::new(),
            destination: message.peer(),
            ignored: false,
        }
    }
}

impl Message for EmptyMessage {
    fn message_type(&self) -> Option<MessageType> {
        Some(self.mtype)
    }

    fn mid(&self) -> Option<u16> {
        self.mid
    }

    fn token(&self) -> &Bytes {
        &self.token
    }

    fn peer(&self) -> Option<EndpointAddress> {
        self.destination
    }

    fn is_ignored(&self) -> bool {
        self.ignored
    }

    fn set_ignored(&mut self, ignored: bool) {
        self.ignored = ignored;
    }
}
