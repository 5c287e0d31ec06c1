use crate::error::CommandError;
use crate::protocol::{
    DmPayload, EnvelopeType, InvitePayload, JoinPayload, LeavePayload, Payload, ProtocolEnvelope,
    UserInfoPayload,
};

/// A slash command split into its name and positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl SlashCommand {
    /// Split `/name arg1 arg2 ...` on whitespace.
    pub fn parse(content: &str) -> Result<Self, CommandError> {
        if !content.starts_with('/') {
            return Err(CommandError::NotACommand);
        }
        let mut tokens = content.split_whitespace();
        let name = tokens
            .next()
            .map(|t| t.trim_start_matches('/'))
            .unwrap_or_default();
        if name.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self {
            name: name.to_string(),
            args: tokens.map(str::to_string).collect(),
        })
    }

    /// Map onto a known command, checking its arguments.
    pub fn command(&self) -> Result<Command, CommandError> {
        let first = |command: &'static str, what: &'static str| {
            self.args
                .first()
                .cloned()
                .ok_or(CommandError::MissingArgument { command, what })
        };

        match self.name.as_str() {
            "join" => Ok(Command::Join {
                invite_code: first("join", "an invite code")?,
            }),
            "leave" => Ok(Command::Leave {
                reason: (!self.args.is_empty()).then(|| self.args.join(" ")),
            }),
            "invite" => Ok(Command::Invite {
                target: first("invite", "a username")?,
            }),
            "block" => Ok(Command::Block {
                nickname: first("block", "a username")?,
            }),
            "unblock" => Ok(Command::Unblock {
                nickname: first("unblock", "a username")?,
            }),
            "dm" => {
                if self.args.len() < 2 {
                    return Err(CommandError::MissingArgument {
                        command: "dm",
                        what: "a username and a message",
                    });
                }
                Ok(Command::Dm {
                    target: self.args[0].clone(),
                    content: self.args[1..].join(" "),
                })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { invite_code: String },
    Leave { reason: Option<String> },
    Invite { target: String },
    Block { nickname: String },
    Unblock { nickname: String },
    Dm { target: String, content: String },
}

/// Who is issuing a command and from which room.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    /// Sender id (hex public key).
    pub from: &'a str,
    pub nickname: &'a str,
    pub public_key: &'a str,
    pub room_id: Option<&'a str>,
}

impl Command {
    pub fn parse(content: &str) -> Result<Self, CommandError> {
        SlashCommand::parse(content)?.command()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
            Command::Invite { .. } => "invite",
            Command::Block { .. } => "block",
            Command::Unblock { .. } => "unblock",
            Command::Dm { .. } => "dm",
        }
    }

    fn require_room<'a>(&self, ctx: &CommandContext<'a>) -> Result<&'a str, CommandError> {
        ctx.room_id.ok_or(CommandError::NoRoom(self.name()))
    }

    /// Unsigned envelope carrying this command.
    pub fn to_envelope(&self, ctx: &CommandContext<'_>) -> Result<ProtocolEnvelope, CommandError> {
        let envelope = match self {
            Command::Join { invite_code } => {
                let envelope = ProtocolEnvelope::new(EnvelopeType::Join, ctx.from);
                let envelope = match ctx.room_id {
                    Some(room) => envelope.with_room(room),
                    None => envelope,
                };
                envelope.with_payload(Payload::Join(JoinPayload {
                    room_id: None,
                    invite_code: invite_code.clone(),
                    nickname: ctx.nickname.to_string(),
                    public_key: ctx.public_key.to_string(),
                }))?
            }
            Command::Leave { reason } => {
                let room = self.require_room(ctx)?;
                ProtocolEnvelope::new(EnvelopeType::Leave, ctx.from)
                    .with_room(room)
                    .with_payload(Payload::Leave(LeavePayload {
                        room_id: room.to_string(),
                        reason: reason.clone(),
                    }))?
            }
            Command::Invite { target } => {
                let room = self.require_room(ctx)?;
                ProtocolEnvelope::new(EnvelopeType::Invite, ctx.from)
                    .with_room(room)
                    .with_recipient(target.clone())
                    .with_payload(Payload::Invite(InvitePayload {
                        room_id: room.to_string(),
                        target: target.clone(),
                        invite_code: None,
                        room_name: None,
                        description: None,
                        is_private: false,
                    }))?
            }
            Command::Block { nickname } | Command::Unblock { nickname } => {
                let room = self.require_room(ctx)?;
                let blocked = matches!(self, Command::Block { .. });
                let (kind, payload) = user_info(nickname, blocked);
                ProtocolEnvelope::new(kind, ctx.from)
                    .with_room(room)
                    .with_payload(payload)?
            }
            Command::Dm { target, content } => ProtocolEnvelope::new(EnvelopeType::Dm, ctx.from)
                .with_recipient(target.clone())
                .with_payload(Payload::Dm(DmPayload {
                    content: content.clone(),
                    is_encrypted: false,
                }))?,
        };
        Ok(envelope)
    }
}

fn user_info(nickname: &str, blocked: bool) -> (EnvelopeType, Payload) {
    let info = UserInfoPayload {
        nickname: nickname.to_string(),
        is_blocked: blocked,
        public_key: None,
        fingerprint: None,
    };
    if blocked {
        (EnvelopeType::Block, Payload::Block(info))
    } else {
        (EnvelopeType::Unblock, Payload::Unblock(info))
    }
}
