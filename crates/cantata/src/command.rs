use tracing::debug;

use crate::{idle::IdleEvents, permission::Permission};

/// What the command layer wants the session layer to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Completed; the session layer appends the `OK` terminator.
    Ok,
    /// The command already produced its own terminator (an ACK error line,
    /// or a synchronous idle delivery); nothing further is appended.
    Handled,
    /// Drop this session.
    Close,
    /// Tear down the whole daemon.
    Kill,
}

/// The session surface a command implementation writes through.
///
/// Reply bytes land in the session's staging buffer; the session layer
/// decides between a direct socket write and the deferred queue after the
/// command returns.
pub trait ClientControl {
    fn write(&mut self, bytes: &[u8]);

    /// Writes `line` followed by a newline.
    fn puts(&mut self, line: &str) {
        self.write(line.as_bytes());
        self.write(b"\n");
    }

    /// Peer uid, when the transport can prove one (Unix sockets).
    fn uid(&self) -> Option<u32>;

    fn permission(&self) -> Permission;

    fn set_permission(&mut self, permission: Permission);

    fn is_expired(&self) -> bool;

    /// Enters idle mode with the given subscription mask. Returns `true`
    /// when pending flags were delivered synchronously, `false` when the
    /// client is now blocked awaiting a notification.
    fn idle_wait(&mut self, subscriptions: IdleEvents) -> bool;
}

/// Executes request lines against a session.
///
/// `process_list` receives the lines of a `command_list_begin` batch in
/// arrival order; with `per_step_ack` each successful step is followed by
/// `list_OK` and the session layer appends the final `OK`.
pub trait CommandHandler {
    fn process(&mut self, client: &mut dyn ClientControl, line: &str) -> CommandOutcome;

    fn process_list(
        &mut self,
        client: &mut dyn ClientControl,
        per_step_ack: bool,
        lines: &[String],
    ) -> CommandOutcome;
}

/// Protocol error codes carried in ACK lines.
#[derive(Clone, Copy, Debug)]
enum Ack {
    Arg = 2,
    Permission = 4,
    UnknownCommand = 5,
}

fn ack(client: &mut dyn ClientControl, error: Ack, index: usize, verb: &str, message: &str) {
    client.puts(&format!("ACK [{}@{index}] {{{verb}}} {message}", error as u32));
}

#[derive(Clone, Copy)]
struct Ctx {
    /// Position of this line within a command list; 0 outside one.
    index: usize,
    in_list: bool,
}

struct CommandDef {
    name: &'static str,
    permission: Permission,
    /// Inclusive argument count bounds.
    args: (usize, usize),
    run: fn(&mut dyn ClientControl, &[&str], Ctx) -> CommandOutcome,
}

static COMMANDS: &[CommandDef] = &[
    CommandDef { name: "close", permission: Permission::empty(), args: (0, 0), run: cmd_close },
    CommandDef {
        name: "commands",
        permission: Permission::empty(),
        args: (0, 0),
        run: cmd_commands,
    },
    CommandDef { name: "idle", permission: Permission::READ, args: (0, 8), run: cmd_idle },
    CommandDef { name: "kill", permission: Permission::ADMIN, args: (0, 0), run: cmd_kill },
    CommandDef {
        name: "notcommands",
        permission: Permission::empty(),
        args: (0, 0),
        run: cmd_notcommands,
    },
    CommandDef { name: "ping", permission: Permission::empty(), args: (0, 0), run: cmd_ping },
];

fn cmd_close(_client: &mut dyn ClientControl, _args: &[&str], _ctx: Ctx) -> CommandOutcome {
    CommandOutcome::Close
}

fn cmd_kill(_client: &mut dyn ClientControl, _args: &[&str], _ctx: Ctx) -> CommandOutcome {
    CommandOutcome::Kill
}

fn cmd_ping(_client: &mut dyn ClientControl, _args: &[&str], _ctx: Ctx) -> CommandOutcome {
    CommandOutcome::Ok
}

fn cmd_commands(client: &mut dyn ClientControl, _args: &[&str], _ctx: Ctx) -> CommandOutcome {
    let permission = client.permission();
    for def in COMMANDS.iter().filter(|d| permission.contains(d.permission)) {
        client.puts(&format!("command: {}", def.name));
    }
    CommandOutcome::Ok
}

fn cmd_notcommands(client: &mut dyn ClientControl, _args: &[&str], _ctx: Ctx) -> CommandOutcome {
    let permission = client.permission();
    for def in COMMANDS.iter().filter(|d| !permission.contains(d.permission)) {
        client.puts(&format!("command: {}", def.name));
    }
    CommandOutcome::Ok
}

fn cmd_idle(client: &mut dyn ClientControl, args: &[&str], ctx: Ctx) -> CommandOutcome {
    if ctx.in_list {
        ack(client, Ack::Arg, ctx.index, "idle", "idle is not allowed in a command list");
        return CommandOutcome::Handled;
    }

    let mut mask = IdleEvents::empty();
    for arg in args {
        match IdleEvents::from_wire_name(arg) {
            Some(event) => mask |= event,
            None => {
                ack(
                    client,
                    Ack::Arg,
                    ctx.index,
                    "idle",
                    &format!("unrecognized idle event: {arg}"),
                );
                return CommandOutcome::Handled;
            }
        }
    }
    if mask.is_empty() {
        mask = IdleEvents::all();
    }

    // Either way the reply (if any) has already been written: a synchronous
    // delivery carries its own OK, a blocked wait stays silent.
    client.idle_wait(mask);
    CommandOutcome::Handled
}

/// The built-in command layer: the handful of verbs the daemon core answers
/// itself. Player, database and mixer verbs live in their own subsystems
/// and plug in through [`CommandHandler`].
#[derive(Debug, Default)]
pub struct Interpreter;

impl Interpreter {
    fn dispatch(&mut self, client: &mut dyn ClientControl, line: &str, ctx: Ctx) -> CommandOutcome {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            ack(client, Ack::UnknownCommand, ctx.index, "", "no command given");
            return CommandOutcome::Handled;
        };
        let args: Vec<&str> = parts.collect();

        let Some(def) = COMMANDS.iter().find(|d| d.name == verb) else {
            debug!(verb, "unknown command");
            ack(
                client,
                Ack::UnknownCommand,
                ctx.index,
                verb,
                &format!("unknown command {verb:?}"),
            );
            return CommandOutcome::Handled;
        };

        if !client.permission().contains(def.permission) {
            ack(
                client,
                Ack::Permission,
                ctx.index,
                verb,
                &format!("you don't have permission for {verb:?}"),
            );
            return CommandOutcome::Handled;
        }

        let (min, max) = def.args;
        if args.len() < min || args.len() > max {
            ack(client, Ack::Arg, ctx.index, verb, "wrong number of arguments");
            return CommandOutcome::Handled;
        }

        (def.run)(client, &args, ctx)
    }
}

impl CommandHandler for Interpreter {
    fn process(&mut self, client: &mut dyn ClientControl, line: &str) -> CommandOutcome {
        self.dispatch(client, line, Ctx { index: 0, in_list: false })
    }

    fn process_list(
        &mut self,
        client: &mut dyn ClientControl,
        per_step_ack: bool,
        lines: &[String],
    ) -> CommandOutcome {
        for (index, line) in lines.iter().enumerate() {
            match self.dispatch(client, line, Ctx { index, in_list: true }) {
                CommandOutcome::Ok => {
                    if per_step_ack {
                        client.puts("list_OK");
                    }
                }
                // An ACK stops the batch at its index; Close and Kill
                // propagate untouched.
                outcome => return outcome,
            }
            if client.is_expired() {
                return CommandOutcome::Close;
            }
        }
        CommandOutcome::Ok
    }
}
