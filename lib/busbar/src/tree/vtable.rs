use std::cell::RefCell;

use crate::dispatch::DispatchCtx;
use crate::message::{Message, Value};
use crate::support::{self, BusResult, Fault, Handled};

pub type MethodHandler = Box<dyn FnMut(&mut DispatchCtx, &Message) -> BusResult<Handled>>;
pub type PropertyGetter = Box<dyn FnMut(&PropertyRef) -> BusResult<Value>>;
pub type PropertySetter = Box<dyn FnMut(&PropertyRef, &Value) -> BusResult<()>>;

/// Identifies the property a getter or setter is being invoked for. A
/// fallback vtable serves many paths through one handler set, so the
/// concrete path travels with every access.
#[derive(Debug, Copy, Clone)]
pub struct PropertyRef<'a> {
    pub path: &'a str,
    pub interface: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PropertyFlags {
    /// PropertiesChanged carries the new value when this property changes.
    pub emits_change: bool,
    /// PropertiesChanged only names the property, without a value.
    /// Requires `emits_change`.
    pub invalidate_only: bool,
}

pub struct MethodDef {
    member: String,
    in_sig: String,
    out_sig: String,
    handler: RefCell<MethodHandler>,
}

impl MethodDef {
    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn in_sig(&self) -> &str {
        &self.in_sig
    }

    #[inline]
    pub fn out_sig(&self) -> &str {
        &self.out_sig
    }

    #[inline]
    pub(crate) fn invoke(&self, ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
        (self.handler.borrow_mut())(ctx, message)
    }
}

pub struct PropertyDef {
    member: String,
    sig: String,
    flags: PropertyFlags,
    getter: RefCell<PropertyGetter>,
    setter: Option<RefCell<PropertySetter>>,
}

impl PropertyDef {
    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn sig(&self) -> &str {
        &self.sig
    }

    #[inline]
    pub fn flags(&self) -> PropertyFlags {
        self.flags
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Runs the getter and checks the produced value against the declared
    /// signature.
    pub(crate) fn read(&self, property: &PropertyRef) -> BusResult<Value> {
        let value = (self.getter.borrow_mut())(property)?;
        if value.signature() != self.sig {
            return Err(Fault::InvalidArgument.into());
        }
        Ok(value)
    }

    /// Runs the setter. The caller has already verified writability and
    /// the value signature.
    pub(crate) fn write(&self, property: &PropertyRef, value: &Value) -> BusResult<()> {
        let setter = self.setter.as_ref().ok_or(Fault::PermissionDenied)?;
        (setter.borrow_mut())(property, value)
    }
}

pub struct SignalDef {
    member: String,
    sig: String,
}

impl SignalDef {
    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn sig(&self) -> &str {
        &self.sig
    }
}

/// Ordered description of one interface: methods, properties and signals
/// with their handlers. Built up front, validated as it grows, then
/// attached to a tree node.
pub struct Vtable {
    interface: String,
    methods: Vec<MethodDef>,
    properties: Vec<PropertyDef>,
    signals: Vec<SignalDef>,
}

impl Vtable {
    pub fn new(interface: &str) -> BusResult<Vtable> {
        if !support::interface_name_is_valid(interface) {
            return Err(Fault::InvalidArgument.into());
        }

        Ok(Vtable {
            interface: interface.to_string(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        })
    }

    #[inline]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(
        mut self,
        member: &str,
        in_sig: &str,
        out_sig: &str,
        handler: MethodHandler,
    ) -> BusResult<Vtable> {
        self.check_member(member)?;
        if !support::signature_is_valid(in_sig) || !support::signature_is_valid(out_sig) {
            return Err(Fault::InvalidArgument.into());
        }

        self.methods.push(MethodDef {
            member: member.to_string(),
            in_sig: in_sig.to_string(),
            out_sig: out_sig.to_string(),
            handler: RefCell::new(handler),
        });
        Ok(self)
    }

    /// Adds a read-only property.
    pub fn property(
        self,
        member: &str,
        sig: &str,
        flags: PropertyFlags,
        getter: PropertyGetter,
    ) -> BusResult<Vtable> {
        self.add_property(member, sig, flags, getter, None)
    }

    /// Adds a read-write property.
    pub fn writable_property(
        self,
        member: &str,
        sig: &str,
        flags: PropertyFlags,
        getter: PropertyGetter,
        setter: PropertySetter,
    ) -> BusResult<Vtable> {
        self.add_property(member, sig, flags, getter, Some(setter))
    }

    fn add_property(
        mut self,
        member: &str,
        sig: &str,
        flags: PropertyFlags,
        getter: PropertyGetter,
        setter: Option<PropertySetter>,
    ) -> BusResult<Vtable> {
        self.check_member(member)?;
        // A property is one complete type
        if support::signature_split(sig).map_or(true, |parts| parts.len() != 1) {
            return Err(Fault::InvalidArgument.into());
        }
        if flags.invalidate_only && !flags.emits_change {
            return Err(Fault::InvalidArgument.into());
        }

        self.properties.push(PropertyDef {
            member: member.to_string(),
            sig: sig.to_string(),
            flags,
            getter: RefCell::new(getter),
            setter: setter.map(RefCell::new),
        });
        Ok(self)
    }

    pub fn signal(mut self, member: &str, sig: &str) -> BusResult<Vtable> {
        self.check_member(member)?;
        if !support::signature_is_valid(sig) {
            return Err(Fault::InvalidArgument.into());
        }

        self.signals.push(SignalDef {
            member: member.to_string(),
            sig: sig.to_string(),
        });
        Ok(self)
    }

    #[inline]
    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    #[inline]
    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    #[inline]
    pub fn signals(&self) -> &[SignalDef] {
        &self.signals
    }

    pub fn find_method(&self, member: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|def| def.member == member)
    }

    pub fn find_property(&self, member: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|def| def.member == member)
    }

    fn check_member(&self, member: &str) -> BusResult<()> {
        if !support::member_name_is_valid(member) {
            return Err(Fault::InvalidArgument.into());
        }

        // Methods, properties and signals share the member namespace
        let taken = self.methods.iter().any(|def| def.member == member)
            || self.properties.iter().any(|def| def.member == member)
            || self.signals.iter().any(|def| def.member == member);

        if taken {
            return Err(Fault::AlreadyExists.into());
        }
        Ok(())
    }
}
