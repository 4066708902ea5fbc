use serde_derive::{Deserialize, Serialize};

use crate::support::{self, BusResult, Fault};

/// Wire protocol version stamped on every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message flag bits.
pub mod flags {
    /// The sender does not expect a method return.
    pub const NO_REPLY_EXPECTED: u8 = 0x1;
    /// Do not auto-start an owner for the destination name.
    pub const NO_AUTO_START: u8 = 0x2;
}

/// Well-known error names carried in method-error messages.
pub mod error_name {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    MethodError,
    Signal,
}

/// In-memory body element. Wire marshalling of these values is the codec
/// collaborator's concern; the engine only composes and inspects them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    Variant(Box<Value>),
    /// Element signature plus elements, so empty arrays stay typed.
    Array(String, Vec<Value>),
    Struct(Vec<Value>),
    /// Key signature, value signature, entries.
    Dict(String, String, Vec<(Value, Value)>),
}

impl Value {
    /// Returns the single complete type signature of this value.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Byte(_) => out.push('y'),
            Value::Bool(_) => out.push('b'),
            Value::Int16(_) => out.push('n'),
            Value::Uint16(_) => out.push('q'),
            Value::Int32(_) => out.push('i'),
            Value::Uint32(_) => out.push('u'),
            Value::Int64(_) => out.push('x'),
            Value::Uint64(_) => out.push('t'),
            Value::Double(_) => out.push('d'),
            Value::Str(_) => out.push('s'),
            Value::ObjectPath(_) => out.push('o'),
            Value::Signature(_) => out.push('g'),
            Value::UnixFd(_) => out.push('h'),
            Value::Variant(_) => out.push('v'),
            Value::Array(element, _) => {
                out.push('a');
                out.push_str(element);
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::Dict(key, value, _) => {
                out.push_str("a{");
                out.push_str(key);
                out.push_str(value);
                out.push('}');
            }
        }
    }
}

/// One bus message. Opaque payload marshalling aside, this carries every
/// field the connection engine routes on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    ty: MessageType,
    flags: u8,
    version: u8,
    serial: u32,
    reply_serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    error_name: Option<String>,
    error_message: Option<String>,
    fd_count: u32,
    body: Vec<Value>,
    sealed: bool,
}

impl Message {
    fn blank(ty: MessageType) -> Message {
        Message {
            ty,
            flags: 0,
            version: PROTOCOL_VERSION,
            serial: 0,
            reply_serial: 0,
            path: None,
            interface: None,
            member: None,
            destination: None,
            sender: None,
            error_name: None,
            error_message: None,
            fd_count: 0,
            body: Vec::new(),
            sealed: false,
        }
    }

    /// Creates a method call addressed to `path`, `interface` and `member`.
    pub fn method_call(path: &str, interface: &str, member: &str) -> BusResult<Message> {
        if !support::object_path_is_valid(path)
            || !support::interface_name_is_valid(interface)
            || !support::member_name_is_valid(member)
        {
            return Err(Fault::InvalidArgument.into());
        }

        let mut message = Message::blank(MessageType::MethodCall);
        message.path = Some(path.to_string());
        message.interface = Some(interface.to_string());
        message.member = Some(member.to_string());
        Ok(message)
    }

    /// Creates a signal originating from `path`.
    pub fn signal(path: &str, interface: &str, member: &str) -> BusResult<Message> {
        if !support::object_path_is_valid(path)
            || !support::interface_name_is_valid(interface)
            || !support::member_name_is_valid(member)
        {
            return Err(Fault::InvalidArgument.into());
        }

        let mut message = Message::blank(MessageType::Signal);
        message.flags = flags::NO_REPLY_EXPECTED;
        message.path = Some(path.to_string());
        message.interface = Some(interface.to_string());
        message.member = Some(member.to_string());
        Ok(message)
    }

    /// Creates the method return for a sealed incoming call.
    pub fn method_return(call: &Message) -> BusResult<Message> {
        if call.ty != MessageType::MethodCall || call.serial == 0 {
            return Err(Fault::InvalidArgument.into());
        }

        let mut message = Message::blank(MessageType::MethodReturn);
        message.flags = flags::NO_REPLY_EXPECTED;
        message.reply_serial = call.serial;
        message.destination = call.sender.clone();
        Ok(message)
    }

    /// Creates the method error for a sealed incoming call.
    pub fn method_error(call: &Message, name: &str, text: &str) -> BusResult<Message> {
        if !support::interface_name_is_valid(name) {
            return Err(Fault::InvalidArgument.into());
        }

        let mut message = Message::method_return(call)?;
        message.ty = MessageType::MethodError;
        message.error_name = Some(name.to_string());
        message.error_message = Some(text.to_string());
        Ok(message)
    }

    /// Creates a locally synthesized method error for a reply serial no
    /// message exists for, such as a tracker timeout.
    pub(crate) fn synthetic_error(reply_serial: u32, name: &str, text: &str) -> Message {
        let mut message = Message::blank(MessageType::MethodError);
        message.flags = flags::NO_REPLY_EXPECTED;
        message.reply_serial = reply_serial;
        message.error_name = Some(name.to_string());
        message.error_message = Some(text.to_string());
        message.sealed = true;
        message
    }

    #[inline]
    pub fn ty(&self) -> MessageType {
        self.ty
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    #[inline]
    pub fn reply_serial(&self) -> u32 {
        self.reply_serial
    }

    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[inline]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    #[inline]
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    #[inline]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    #[inline]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    #[inline]
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    #[inline]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[inline]
    pub fn fd_count(&self) -> u32 {
        self.fd_count
    }

    #[inline]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// True for method returns and method errors.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.ty == MessageType::MethodReturn || self.ty == MessageType::MethodError
    }

    /// True when the sender is owed a reply for this message.
    #[inline]
    pub fn expects_reply(&self) -> bool {
        self.ty == MessageType::MethodCall && self.flags & flags::NO_REPLY_EXPECTED == 0
    }

    /// Concatenated signature of the body values.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        for value in &self.body {
            out.push_str(&value.signature());
        }
        out
    }

    pub fn set_destination(&mut self, destination: Option<String>) -> BusResult<()> {
        self.check_unsealed()?;
        if let Some(name) = &destination {
            if !support::bus_name_is_valid(name) {
                return Err(Fault::InvalidArgument.into());
            }
        }
        self.destination = destination;
        Ok(())
    }

    pub fn set_sender(&mut self, sender: Option<String>) -> BusResult<()> {
        self.check_unsealed()?;
        if let Some(name) = &sender {
            if !support::bus_name_is_valid(name) {
                return Err(Fault::InvalidArgument.into());
            }
        }
        self.sender = sender;
        Ok(())
    }

    pub fn set_flags(&mut self, value: u8) -> BusResult<()> {
        self.check_unsealed()?;
        self.flags = value;
        Ok(())
    }

    pub fn set_fd_count(&mut self, count: u32) -> BusResult<()> {
        self.check_unsealed()?;
        self.fd_count = count;
        Ok(())
    }

    /// Appends one value to the body.
    pub fn append(&mut self, value: Value) -> BusResult<()> {
        self.check_unsealed()?;
        self.body.push(value);
        Ok(())
    }

    /// Assigns the serial and freezes the message. A message is sealed
    /// exactly once; zero is never a valid serial.
    pub(crate) fn seal(&mut self, serial: u32) -> BusResult<()> {
        if serial == 0 {
            return Err(Fault::InvalidArgument.into());
        }
        self.check_unsealed()?;
        self.serial = serial;
        self.sealed = true;
        Ok(())
    }

    #[inline]
    fn check_unsealed(&self) -> BusResult<()> {
        if self.sealed {
            return Err(Fault::PermissionDenied.into());
        }
        Ok(())
    }
}
