//! Protocol codes and message types

use std::fmt;

/// CoAP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Confirmable
    Con = 0,
    /// Non-confirmable
    Non = 1,
    /// Acknowledgement
    Ack = 2,
    /// Reset
    Rst = 3,
}

impl MessageType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(MessageType::Con),
            1 => Some(MessageType::Non),
            2 => Some(MessageType::Ack),
            3 => Some(MessageType::Rst),
            _ => None,
        }
    }

    /// ACK and RST never elicit a control reply of their own
    pub fn is_control(&self) -> bool {
        matches!(self, MessageType::Ack | MessageType::Rst)
    }
}

/// Request methods (code class 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

impl Method {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Method::Get),
            2 => Some(Method::Post),
            3 => Some(Method::Put),
            4 => Some(Method::Delete),
            _ => None,
        }
    }

    /// GET is the only method that does not change server state
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Response codes, encoded as `class << 5 | detail`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    // 2.xx Success
    Created = 65,
    Deleted = 66,
    Valid = 67,
    Changed = 68,
    Content = 69,
    Continue = 95,

    // 4.xx Client error
    BadRequest = 128,
    Unauthorized = 129,
    BadOption = 130,
    Forbidden = 131,
    NotFound = 132,
    MethodNotAllowed = 133,
    NotAcceptable = 134,
    PreconditionFailed = 140,
    RequestEntityTooLarge = 141,
    UnsupportedContentFormat = 143,

    // 5.xx Server error
    InternalServerError = 160,
    NotImplemented = 161,
    BadGateway = 162,
    ServiceUnavailable = 163,
    GatewayTimeout = 164,
    ProxyingNotSupported = 165,
}

impl ResponseCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        use ResponseCode::*;
        let code = match val {
            65 => Created,
            66 => Deleted,
            67 => Valid,
            68 => Changed,
            69 => Content,
            95 => Continue,
            128 => BadRequest,
            129 => Unauthorized,
            130 => BadOption,
            131 => Forbidden,
            132 => NotFound,
            133 => MethodNotAllowed,
            134 => NotAcceptable,
            140 => PreconditionFailed,
            141 => RequestEntityTooLarge,
            143 => UnsupportedContentFormat,
            160 => InternalServerError,
            161 => NotImplemented,
            162 => BadGateway,
            163 => ServiceUnavailable,
            164 => GatewayTimeout,
            165 => ProxyingNotSupported,
            _ => return None,
        };
        Some(code)
    }

    /// Parse from dotted `class.detail` form, e.g. `(2, 5)` for 2.05
    pub fn from_parts(class: u8, detail: u8) -> crate::Result<Self> {
        if class > 7 || detail > 31 {
            return Err(crate::Error::UnknownCode(class, detail));
        }
        Self::from_u8(class << 5 | detail).ok_or(crate::Error::UnknownCode(class, detail))
    }

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn class(&self) -> u8 {
        self.value() >> 5
    }

    pub fn detail(&self) -> u8 {
        self.value() & 0x1f
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn is_client_error(&self) -> bool {
        self.class() == 4
    }

    pub fn is_server_error(&self) -> bool {
        self.class() == 5
    }

    /// 2.01 Created, 2.02 Deleted and 2.04 Changed invalidate stored representations
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            ResponseCode::Created | ResponseCode::Deleted | ResponseCode::Changed
        )
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}
