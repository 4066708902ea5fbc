use flux::choose;

use crate::dispatch::DispatchCtx;
use crate::message::{error_name, Message, MessageType, Value};
use crate::support::{BusError, BusResult, Fault, Handled};
use crate::tree::vtable::PropertyRef;
use crate::tree::{self, ObjectTree};

pub const INTERFACE_PEER: &str = "org.freedesktop.DBus.Peer";
pub const INTERFACE_INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const INTERFACE_PROPERTIES: &str = "org.freedesktop.DBus.Properties";
pub const INTERFACE_OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

/// Name, path and interface of the broker itself.
pub const BUS_SERVICE: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Handles `org.freedesktop.DBus.Peer` calls addressed to this
/// connection, regardless of path.
pub(crate) fn peer_dispatch(ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
    if message.ty() != MessageType::MethodCall || message.interface() != Some(INTERFACE_PEER) {
        return Ok(Handled::No);
    }

    match message.member() {
        Some("Ping") => {
            if !message.signature().is_empty() {
                ctx.reply_error(message, error_name::INVALID_ARGS, "Expected no arguments")?;
            } else {
                ctx.reply_return(message, vec![])?;
            }
        }
        Some("GetMachineId") => match flux::util::machine_id() {
            Ok(id) => ctx.reply_return(message, vec![Value::Str(id)])?,
            Err(_) => {
                ctx.reply_error(message, error_name::FAILED, "Machine id unavailable")?;
            }
        },
        _ => {
            ctx.reply_error(message, error_name::UNKNOWN_METHOD, "Unknown method")?;
        }
    }

    Ok(Handled::Yes)
}

/// Handles `org.freedesktop.DBus.Properties` calls for the object at
/// `path`. Returns `No` when the path has nothing at all, so the caller
/// can produce the unknown-object reply.
pub(crate) fn properties_dispatch(
    ctx: &mut DispatchCtx,
    path: &str,
    message: &Message,
) -> BusResult<Handled> {
    match message.member() {
        Some("Get") => properties_get(ctx, path, message),
        Some("Set") => properties_set(ctx, path, message),
        Some("GetAll") => properties_get_all(ctx, path, message),
        _ => {
            ctx.reply_error(message, error_name::UNKNOWN_METHOD, "Unknown method")?;
            Ok(Handled::Yes)
        }
    }
}

fn properties_get(ctx: &mut DispatchCtx, path: &str, message: &Message) -> BusResult<Handled> {
    if message.signature() != "ss" {
        ctx.reply_error(message, error_name::INVALID_ARGS, "Expected (ss)")?;
        return Ok(Handled::Yes);
    }

    let (interface, name) = match message.body() {
        [Value::Str(interface), Value::Str(name)] => (interface.clone(), name.clone()),
        _ => unreachable!("signature checked above"),
    };

    if let Some(member_ref) = find_property(ctx.tree, path, &interface, &name) {
        let def = &member_ref.slot.vtable().properties()[member_ref.index];
        let property = PropertyRef {
            path,
            interface: &interface,
            name: &name,
        };

        return match def.read(&property) {
            Ok(value) => {
                ctx.reply_return(message, vec![Value::Variant(Box::new(value))])?;
                Ok(Handled::Yes)
            }
            Err(fault) => fault_reply(ctx, message, fault),
        };
    }

    if ctx.tree.object_exists(path)? {
        ctx.reply_error(message, error_name::UNKNOWN_PROPERTY, "Unknown property")?;
        return Ok(Handled::Yes);
    }

    Ok(Handled::No)
}

fn properties_set(ctx: &mut DispatchCtx, path: &str, message: &Message) -> BusResult<Handled> {
    if message.signature() != "ssv" {
        ctx.reply_error(message, error_name::INVALID_ARGS, "Expected (ssv)")?;
        return Ok(Handled::Yes);
    }

    let (interface, name, value) = match message.body() {
        [Value::Str(interface), Value::Str(name), Value::Variant(value)] => {
            (interface.clone(), name.clone(), (**value).clone())
        }
        _ => unreachable!("signature checked above"),
    };

    if let Some(member_ref) = find_property(ctx.tree, path, &interface, &name) {
        let def = &member_ref.slot.vtable().properties()[member_ref.index];

        if !def.is_writable() {
            ctx.reply_error(message, error_name::PROPERTY_READ_ONLY, "Property is read-only")?;
            return Ok(Handled::Yes);
        }
        if value.signature() != def.sig() {
            ctx.reply_error(message, error_name::INVALID_ARGS, "Value signature mismatch")?;
            return Ok(Handled::Yes);
        }

        let property = PropertyRef {
            path,
            interface: &interface,
            name: &name,
        };

        return match def.write(&property, &value) {
            Ok(()) => {
                ctx.reply_return(message, vec![])?;
                Ok(Handled::Yes)
            }
            Err(fault) => fault_reply(ctx, message, fault),
        };
    }

    if ctx.tree.object_exists(path)? {
        ctx.reply_error(message, error_name::UNKNOWN_PROPERTY, "Unknown property")?;
        return Ok(Handled::Yes);
    }

    Ok(Handled::No)
}

fn properties_get_all(ctx: &mut DispatchCtx, path: &str, message: &Message) -> BusResult<Handled> {
    if message.signature() != "s" {
        ctx.reply_error(message, error_name::INVALID_ARGS, "Expected (s)")?;
        return Ok(Handled::Yes);
    }

    let interface = match message.body() {
        [Value::Str(interface)] => interface.clone(),
        _ => unreachable!("signature checked above"),
    };

    let slots = ctx.tree.vtables_for_object(path);
    // An empty interface string selects every interface at the node
    if !interface.is_empty() && !slots.iter().any(|s| s.vtable().interface() == interface) {
        if ctx.tree.object_exists(path)? {
            ctx.reply_error(message, error_name::UNKNOWN_INTERFACE, "Unknown interface")?;
            return Ok(Handled::Yes);
        }
        return Ok(Handled::No);
    }

    let mut entries = Vec::new();
    for slot in slots {
        if !interface.is_empty() && slot.vtable().interface() != interface {
            continue;
        }
        for def in slot.vtable().properties() {
            let property = PropertyRef {
                path,
                interface: slot.vtable().interface(),
                name: def.member(),
            };
            match def.read(&property) {
                Ok(value) => entries.push((
                    Value::Str(def.member().to_string()),
                    Value::Variant(Box::new(value)),
                )),
                Err(fault) => return fault_reply(ctx, message, fault),
            }
        }
    }

    ctx.reply_return(
        message,
        vec![Value::Dict("s".to_string(), "v".to_string(), entries)],
    )?;
    Ok(Handled::Yes)
}

/// Handles `org.freedesktop.DBus.Introspectable.Introspect`.
pub(crate) fn introspect_dispatch(
    ctx: &mut DispatchCtx,
    path: &str,
    message: &Message,
) -> BusResult<Handled> {
    match message.member() {
        Some("Introspect") => {
            if !message.signature().is_empty() {
                ctx.reply_error(message, error_name::INVALID_ARGS, "Expected no arguments")?;
                return Ok(Handled::Yes);
            }
            if !ctx.tree.object_exists(path)? {
                return Ok(Handled::No);
            }

            let xml = introspect_xml(ctx.tree, path)?;
            ctx.reply_return(message, vec![Value::Str(xml)])?;
            Ok(Handled::Yes)
        }
        _ => {
            ctx.reply_error(message, error_name::UNKNOWN_METHOD, "Unknown method")?;
            Ok(Handled::Yes)
        }
    }
}

/// Handles `org.freedesktop.DBus.ObjectManager` calls. Only nodes below
/// an object-manager root answer them.
pub(crate) fn object_manager_dispatch(
    ctx: &mut DispatchCtx,
    path: &str,
    message: &Message,
) -> BusResult<Handled> {
    if !ctx.tree.object_manager_covers(path) {
        return Ok(Handled::No);
    }

    match message.member() {
        Some("GetManagedObjects") => {
            if !message.signature().is_empty() {
                ctx.reply_error(message, error_name::INVALID_ARGS, "Expected no arguments")?;
                return Ok(Handled::Yes);
            }

            let mut entries = Vec::new();
            for object in ctx.tree.managed_paths(path)? {
                match managed_interfaces(ctx.tree, &object) {
                    Ok(interfaces) => entries.push((
                        Value::ObjectPath(object.clone()),
                        Value::Dict("s".to_string(), "a{sv}".to_string(), interfaces),
                    )),
                    Err(fault) => return fault_reply(ctx, message, fault),
                }
            }

            ctx.reply_return(
                message,
                vec![Value::Dict(
                    "o".to_string(),
                    "a{sa{sv}}".to_string(),
                    entries,
                )],
            )?;
            Ok(Handled::Yes)
        }
        Some("InterfacesAdded") | Some("InterfacesRemoved") => {
            ctx.reply_error(message, error_name::NOT_SUPPORTED, "Not implemented")?;
            Ok(Handled::Yes)
        }
        _ => {
            ctx.reply_error(message, error_name::UNKNOWN_METHOD, "Unknown method")?;
            Ok(Handled::Yes)
        }
    }
}

/// Builds the PropertiesChanged signal for the named properties of
/// `interface` at `path`. Every named property must emit change
/// notifications; invalidate-only members go into the invalidated list.
pub(crate) fn properties_changed_message(
    tree: &ObjectTree,
    path: &str,
    interface: &str,
    names: &[&str],
) -> BusResult<Message> {
    let slot = tree
        .vtables_for_object(path)
        .into_iter()
        .find(|slot| slot.vtable().interface() == interface)
        .ok_or(Fault::NotFound)?;

    let mut changed = Vec::new();
    let mut invalidated = Vec::new();

    for name in names {
        let def = slot.vtable().find_property(name).ok_or(Fault::NotFound)?;

        if !def.flags().emits_change {
            return Err(Fault::InvalidArgument.into());
        }

        if def.flags().invalidate_only {
            invalidated.push(Value::Str(name.to_string()));
        } else {
            let property = PropertyRef {
                path,
                interface,
                name,
            };
            let value = def.read(&property)?;
            changed.push((
                Value::Str(name.to_string()),
                Value::Variant(Box::new(value)),
            ));
        }
    }

    let mut message = Message::signal(path, INTERFACE_PROPERTIES, "PropertiesChanged")?;
    message.append(Value::Str(interface.to_string()))?;
    message.append(Value::Dict("s".to_string(), "v".to_string(), changed))?;
    message.append(Value::Array("s".to_string(), invalidated))?;
    Ok(message)
}

/// Resolves a property along the fallback chain: non-fallback at the
/// exact path, fallback at each ancestor.
fn find_property(
    tree: &ObjectTree,
    path: &str,
    interface: &str,
    name: &str,
) -> Option<tree::MemberRef> {
    for (depth, prefix) in tree::prefix_chain(path).iter().enumerate() {
        let fallback = depth != 0;
        if let Some(member_ref) = tree
            .property_ref(prefix, interface, name)
            .filter(|member_ref| member_ref.slot.is_fallback() == fallback)
        {
            return Some(member_ref);
        }
    }
    None
}

/// Interface dictionaries for one managed object: the standard
/// interfaces with empty property sets plus every vtable serving the
/// path with its current property values.
fn managed_interfaces(tree: &ObjectTree, path: &str) -> BusResult<Vec<(Value, Value)>> {
    let mut entries = vec![
        standard_entry(INTERFACE_PEER),
        standard_entry(INTERFACE_INTROSPECTABLE),
        standard_entry(INTERFACE_PROPERTIES),
    ];

    for slot in tree.vtables_for_object(path) {
        let mut properties = Vec::new();
        for def in slot.vtable().properties() {
            let property = PropertyRef {
                path,
                interface: slot.vtable().interface(),
                name: def.member(),
            };
            properties.push((
                Value::Str(def.member().to_string()),
                Value::Variant(Box::new(def.read(&property)?)),
            ));
        }
        entries.push((
            Value::Str(slot.vtable().interface().to_string()),
            Value::Dict("s".to_string(), "v".to_string(), properties),
        ));
    }

    Ok(entries)
}

fn standard_entry(interface: &str) -> (Value, Value) {
    (
        Value::Str(interface.to_string()),
        Value::Dict("s".to_string(), "v".to_string(), Vec::new()),
    )
}

/// Turns a handler fault into the method error owed to the caller. Wire
/// faults keep their name; everything else becomes a generic failure.
fn fault_reply(ctx: &mut DispatchCtx, call: &Message, fault: BusError) -> BusResult<Handled> {
    match fault {
        BusError::Wait => Err(BusError::Wait),
        BusError::Fault(Fault::Wire { name, message }) => {
            ctx.reply_error(call, &name, &message)?;
            Ok(Handled::Yes)
        }
        BusError::Fault(_) => {
            ctx.reply_error(call, error_name::FAILED, "Operation failed")?;
            Ok(Handled::Yes)
        }
    }
}

const XML_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

const XML_PEER: &str = " <interface name=\"org.freedesktop.DBus.Peer\">\n  <method name=\"Ping\"/>\n  <method name=\"GetMachineId\">\n   <arg type=\"s\" direction=\"out\"/>\n  </method>\n </interface>\n";

const XML_INTROSPECTABLE: &str = " <interface name=\"org.freedesktop.DBus.Introspectable\">\n  <method name=\"Introspect\">\n   <arg type=\"s\" direction=\"out\"/>\n  </method>\n </interface>\n";

const XML_PROPERTIES: &str = " <interface name=\"org.freedesktop.DBus.Properties\">\n  <method name=\"Get\">\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"v\" direction=\"out\"/>\n  </method>\n  <method name=\"Set\">\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"v\" direction=\"in\"/>\n  </method>\n  <method name=\"GetAll\">\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"a{sv}\" direction=\"out\"/>\n  </method>\n  <signal name=\"PropertiesChanged\">\n   <arg type=\"s\"/>\n   <arg type=\"a{sv}\"/>\n   <arg type=\"as\"/>\n  </signal>\n </interface>\n";

const XML_OBJECT_MANAGER: &str = " <interface name=\"org.freedesktop.DBus.ObjectManager\">\n  <method name=\"GetManagedObjects\">\n   <arg type=\"a{oa{sa{sv}}}\" direction=\"out\"/>\n  </method>\n  <signal name=\"InterfacesAdded\">\n   <arg type=\"o\"/>\n   <arg type=\"a{sa{sv}}\"/>\n  </signal>\n  <signal name=\"InterfacesRemoved\">\n   <arg type=\"o\"/>\n   <arg type=\"as\"/>\n  </signal>\n </interface>\n";

/// Assembles the introspection document for `path`: the standard
/// interfaces, every vtable attached at the node (including inherited
/// fallbacks) and the child node list.
fn introspect_xml(tree: &ObjectTree, path: &str) -> BusResult<String> {
    let mut out = String::from(XML_DOCTYPE);
    out.push_str("<node>\n");

    out.push_str(XML_PEER);
    out.push_str(XML_INTROSPECTABLE);
    out.push_str(XML_PROPERTIES);
    if tree.object_manager_covers(path) {
        out.push_str(XML_OBJECT_MANAGER);
    }

    for slot in tree.vtables_for_object(path) {
        append_interface_xml(&mut out, slot.vtable());
    }

    for child in tree.children_names(path)? {
        out.push_str(" <node name=\"");
        out.push_str(&xml_escape(&child));
        out.push_str("\"/>\n");
    }

    out.push_str("</node>\n");
    Ok(out)
}

fn append_interface_xml(out: &mut String, vtable: &crate::tree::vtable::Vtable) {
    out.push_str(" <interface name=\"");
    out.push_str(&xml_escape(vtable.interface()));
    out.push_str("\">\n");

    for method in vtable.methods() {
        out.push_str("  <method name=\"");
        out.push_str(&xml_escape(method.member()));
        if method.in_sig().is_empty() && method.out_sig().is_empty() {
            out.push_str("\"/>\n");
            continue;
        }
        out.push_str("\">\n");
        append_args_xml(out, method.in_sig(), "in");
        append_args_xml(out, method.out_sig(), "out");
        out.push_str("  </method>\n");
    }

    for signal in vtable.signals() {
        out.push_str("  <signal name=\"");
        out.push_str(&xml_escape(signal.member()));
        if signal.sig().is_empty() {
            out.push_str("\"/>\n");
            continue;
        }
        out.push_str("\">\n");
        append_args_xml(out, signal.sig(), "");
        out.push_str("  </signal>\n");
    }

    for property in vtable.properties() {
        out.push_str("  <property name=\"");
        out.push_str(&xml_escape(property.member()));
        out.push_str("\" type=\"");
        out.push_str(&xml_escape(property.sig()));
        out.push_str("\" access=\"");
        out.push_str(choose!(property.is_writable() => "readwrite", "read"));
        out.push_str("\"/>\n");
    }

    out.push_str(" </interface>\n");
}

fn append_args_xml(out: &mut String, signature: &str, direction: &str) {
    let parts = match crate::support::signature_split(signature) {
        Some(parts) => parts,
        None => return,
    };

    for part in parts {
        out.push_str("   <arg type=\"");
        out.push_str(&xml_escape(part));
        out.push('"');
        if !direction.is_empty() {
            out.push_str(" direction=\"");
            out.push_str(direction);
            out.push('"');
        }
        out.push_str("/>\n");
    }
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
