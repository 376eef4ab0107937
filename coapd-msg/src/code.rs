//! # Request/Response Code Registry (RFC 7252 Section 12.1)
//!
//! A code is an 8-bit value split into a 3-bit class and a 5-bit detail,
//! conventionally written `c.dd` (e.g. `2.05` Content, `4.04` Not Found).

use core::fmt;

/// An 8-bit CoAP code: `class << 5 | detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Code(pub u8);

impl Code {
    /// Empty message (class 0, detail 0). Used by empty ACKs, RSTs and
    /// the empty-CON keepalive probe.
    pub const EMPTY: Code = Code::new(0, 0);

    // Methods (class 0).
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    // Success responses (class 2).
    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    /// Intermediate Block1 acknowledgement (RFC 7959 Section 2.9.1).
    pub const CONTINUE: Code = Code::new(2, 31);

    // Client error responses (class 4).
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    /// A block-wise transfer is missing earlier blocks (RFC 7959
    /// Section 2.9.2).
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    // Server error responses (class 5).
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const NOT_IMPLEMENTED: Code = Code::new(5, 1);
    pub const BAD_GATEWAY: Code = Code::new(5, 2);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);
    pub const GATEWAY_TIMEOUT: Code = Code::new(5, 4);
    pub const PROXYING_NOT_SUPPORTED: Code = Code::new(5, 5);

    /// Build a code from its class and detail components.
    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class & 0x07) << 5 | (detail & 0x1f))
    }

    /// Construct from the raw wire byte.
    pub const fn from_wire(byte: u8) -> Self {
        Code(byte)
    }

    /// The raw wire byte.
    pub const fn to_wire(self) -> u8 {
        self.0
    }

    /// The 3-bit class component.
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The 5-bit detail component.
    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// True for the empty code `0.00`.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True for method codes `0.01`-`0.31`.
    pub const fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    /// True for any response class (2.xx, 4.xx, 5.xx).
    pub const fn is_response(self) -> bool {
        self.class() >= 2
    }

    /// True for 4.xx and 5.xx responses.
    pub const fn is_error_response(self) -> bool {
        self.class() == 4 || self.class() == 5
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}
