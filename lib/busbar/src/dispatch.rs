use std::collections::VecDeque;

use flux::logging::Logger;

use crate::builtin;
use crate::config::Limits;
use crate::connection::State;
use crate::filter::{FilterCallback, FilterSet, MatchCallback, MatchPredicate, MatchSet};
use crate::message::{error_name, Message, MessageType, Value};
use crate::reply::ReplyTracker;
use crate::support::{self, BusResult, Fault, Handled};
use crate::tree::{self, MemberRef, ObjectTree};

/// Capabilities handed to callbacks while a message is being dispatched.
/// Sends append to the write queue; registrations take effect
/// immediately, with the iteration stamps keeping handlers from running
/// twice for the same message.
///
/// Callbacks must not re-enter `Connection::process`; the connection's
/// busy guard rejects that with `Fault::Busy`.
pub struct DispatchCtx<'a> {
    pub(crate) state: State,
    pub(crate) serial: &'a mut u32,
    pub(crate) wqueue: &'a mut VecDeque<Message>,
    pub(crate) limits: &'a Limits,
    pub(crate) filters: &'a mut FilterSet,
    pub(crate) matches: &'a mut MatchSet,
    pub(crate) tree: &'a mut ObjectTree,
    pub(crate) replies: &'a mut ReplyTracker,
    pub(crate) iteration: u64,
    pub(crate) unique_name: Option<&'a str>,
    pub(crate) log: &'a Logger,
}

impl<'a> DispatchCtx<'a> {
    /// Seals and queues a message for transmission. The write queue keeps
    /// room for one entry even when full.
    pub fn send(&mut self, mut message: Message) -> BusResult<u32> {
        if !message.is_sealed() {
            let serial = support::next_serial(self.serial);
            message.seal(serial)?;
        }
        let serial = message.serial();

        if !self.wqueue.is_empty() && self.wqueue.len() >= self.limits.wqueue_max {
            return Err(Fault::NoBufferSpace.into());
        }

        self.wqueue.push_back(message);
        Ok(serial)
    }

    /// Seals and queues a signal.
    pub fn emit(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> BusResult<u32> {
        let mut message = Message::signal(path, interface, member)?;
        for value in body {
            message.append(value)?;
        }
        self.send(message)
    }

    /// Queues the method return for `call`, a no-op when no reply is
    /// expected.
    pub fn reply_return(&mut self, call: &Message, body: Vec<Value>) -> BusResult<()> {
        if !call.expects_reply() {
            return Ok(());
        }

        let mut reply = Message::method_return(call)?;
        if let Some(name) = self.unique_name {
            reply.set_sender(Some(name.to_string()))?;
        }
        for value in body {
            reply.append(value)?;
        }
        self.send(reply).map(|_| ())
    }

    /// Queues a method error for `call`, a no-op when no reply is
    /// expected.
    pub fn reply_error(&mut self, call: &Message, name: &str, text: &str) -> BusResult<()> {
        if !call.expects_reply() {
            return Ok(());
        }

        let mut reply = Message::method_error(call, name, text)?;
        if let Some(sender) = self.unique_name {
            reply.set_sender(Some(sender.to_string()))?;
        }
        self.send(reply).map(|_| ())
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        self.log
    }

    /// The object tree, for registrations issued from inside callbacks.
    #[inline]
    pub fn objects(&mut self) -> &mut ObjectTree {
        self.tree
    }

    pub fn add_filter(&mut self, callback: FilterCallback) -> u64 {
        self.filters.add(callback)
    }

    pub fn remove_filter(&mut self, id: u64) -> bool {
        self.filters.remove(id)
    }

    pub fn add_match(&mut self, predicate: MatchPredicate, callback: MatchCallback) -> u64 {
        self.matches.add(predicate, callback)
    }

    pub fn remove_match(&mut self, id: u64) -> bool {
        self.matches.remove(id)
    }

    /// Cancels a pending call by serial, reporting whether it existed.
    pub fn cancel_reply(&mut self, serial: u32) -> bool {
        self.replies.cancel(serial)
    }
}

/// Runs one inbound message through the dispatcher chain: replies,
/// filters, matches, built-in peer handling, then the object tree. The
/// hello gate runs in the connection before this is reached.
pub(crate) fn dispatch(ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
    if message.is_reply() {
        if let Some(mut pending) = ctx.replies.take_for_reply(message.reply_serial()) {
            if pending.invoke(ctx, message)? == Handled::Yes {
                return Ok(Handled::Yes);
            }
        }
    }

    if run_filters(ctx, message)? == Handled::Yes {
        return Ok(Handled::Yes);
    }

    if run_matches(ctx, message)? == Handled::Yes {
        return Ok(Handled::Yes);
    }

    if builtin::peer_dispatch(ctx, message)? == Handled::Yes {
        return Ok(Handled::Yes);
    }

    run_objects(ctx, message)
}

pub(crate) fn run_filters(ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
    ctx.filters.begin(ctx.iteration);
    let mut index = 0;

    loop {
        let slot = match ctx.filters.get(index) {
            Some(slot) => slot,
            None => break,
        };

        if slot.last_iteration() == ctx.iteration {
            index += 1;
            continue;
        }
        slot.mark(ctx.iteration);

        if slot.invoke(ctx, message)? == Handled::Yes {
            return Ok(Handled::Yes);
        }

        // A mutated list is rescanned from the head; the iteration stamps
        // skip everything already offered this message
        if ctx.filters.take_modified() {
            index = 0;
        } else {
            index += 1;
        }
    }

    Ok(Handled::No)
}

pub(crate) fn run_matches(ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
    ctx.matches.begin(ctx.iteration);
    let mut index = 0;

    loop {
        let slot = match ctx.matches.get(index) {
            Some(slot) => slot,
            None => break,
        };

        if slot.last_iteration() == ctx.iteration || !slot.applies(message) {
            index += 1;
            continue;
        }
        slot.mark(ctx.iteration);

        if slot.invoke(ctx, message)? == Handled::Yes {
            return Ok(Handled::Yes);
        }

        if ctx.matches.take_modified() {
            index = 0;
        } else {
            index += 1;
        }
    }

    Ok(Handled::No)
}

fn run_objects(ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
    if message.ty() != MessageType::MethodCall {
        return Ok(Handled::No);
    }

    let path = match message.path() {
        Some(path) => path.to_string(),
        None => return Ok(Handled::No),
    };
    let member = match message.member() {
        Some(member) => member.to_string(),
        None => return Ok(Handled::No),
    };

    if run_user_handlers(ctx, message, &path, &member)? == Handled::Yes {
        return Ok(Handled::Yes);
    }

    if let Some(interface) = message.interface() {
        let handled = if interface == builtin::INTERFACE_PROPERTIES {
            builtin::properties_dispatch(ctx, &path, message)?
        } else if interface == builtin::INTERFACE_INTROSPECTABLE {
            builtin::introspect_dispatch(ctx, &path, message)?
        } else if interface == builtin::INTERFACE_OBJECT_MANAGER {
            builtin::object_manager_dispatch(ctx, &path, message)?
        } else {
            Handled::No
        };

        if handled == Handled::Yes {
            return Ok(Handled::Yes);
        }
    }

    if !message.expects_reply() {
        return Ok(Handled::Yes);
    }

    if ctx.tree.object_exists(&path)? {
        ctx.reply_error(message, error_name::UNKNOWN_METHOD, "Unknown method")?;
    } else {
        ctx.reply_error(message, error_name::UNKNOWN_OBJECT, "Unknown object")?;
    }
    Ok(Handled::Yes)
}

/// Plain callbacks and vtable methods: non-fallback registrations at the
/// exact path first, then fallbacks at each ancestor. A tree mutated by a
/// handler restarts the traversal; iteration stamps keep handlers from
/// running twice.
fn run_user_handlers(
    ctx: &mut DispatchCtx,
    message: &Message,
    path: &str,
    member: &str,
) -> BusResult<Handled> {
    'restart: loop {
        let generation = ctx.tree.generation();
        let prefixes = tree::prefix_chain(path);

        for (depth, prefix) in prefixes.iter().enumerate() {
            let fallback = depth != 0;

            for slot in ctx.tree.callbacks_at(prefix, fallback) {
                if slot.last_iteration() == ctx.iteration {
                    continue;
                }
                slot.mark(ctx.iteration);

                if slot.invoke(ctx, message)? == Handled::Yes {
                    return Ok(Handled::Yes);
                }
                if ctx.tree.generation() != generation {
                    continue 'restart;
                }
            }

            let member_ref = match message.interface() {
                Some(interface) => ctx
                    .tree
                    .method_ref(prefix, interface, member)
                    .filter(|member_ref| member_ref.slot.is_fallback() == fallback),
                None => find_method_any_interface(ctx.tree, prefix, member, fallback),
            };

            if let Some(member_ref) = member_ref {
                if member_ref.slot.last_iteration() == ctx.iteration {
                    continue;
                }
                member_ref.slot.mark(ctx.iteration);

                let def = &member_ref.slot.vtable().methods()[member_ref.index];
                if message.signature() != def.in_sig() {
                    ctx.reply_error(message, error_name::INVALID_ARGS, "Invalid arguments")?;
                    return Ok(Handled::Yes);
                }

                if def.invoke(ctx, message)? == Handled::Yes {
                    return Ok(Handled::Yes);
                }
                if ctx.tree.generation() != generation {
                    continue 'restart;
                }
            }
        }

        return Ok(Handled::No);
    }
}

fn find_method_any_interface(
    tree: &ObjectTree,
    prefix: &str,
    member: &str,
    fallback: bool,
) -> Option<MemberRef> {
    for slot in tree.vtables_at(prefix, fallback) {
        if let Some(index) = slot
            .vtable()
            .methods()
            .iter()
            .position(|def| def.member() == member)
        {
            return Some(MemberRef { slot, index });
        }
    }
    None
}
