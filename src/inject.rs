//! Installs standby recovery configuration into an archive as it streams past.

use log::debug;

use crate::{
    error::{Error, Result},
    streamer::{Chunk, Member, Streamer},
    PG_FILE_CREATE_MODE,
};

/// Where recovery settings go in servers that read them from the main
/// configuration.
pub const AUTO_CONF: &str = "postgresql.auto.conf";

/// Marks a data directory as a standby.
pub const STANDBY_SIGNAL: &str = "standby.signal";

/// Where servers before version 12 read recovery settings from.
pub const RECOVERY_CONF: &str = "recovery.conf";

// Ownership historically given to injected files.
const INJECTED_UID: u64 = 0o4000;
const INJECTED_GID: u64 = 0o2000;

/// What to inject.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub content: Vec<u8>,
    /// The server reads recovery settings from its regular configuration
    /// (version 12 and later) instead of from `recovery.conf`.
    pub modern: bool,
}

/// Rewrites the members that carry recovery configuration.
///
/// For modern servers an existing `standby.signal` is dropped, the recovery
/// settings are appended to `postgresql.auto.conf` (which is created if the
/// archive has none) and an empty `standby.signal` is added at the end. For
/// older servers any `recovery.conf` is replaced with one holding the
/// settings.
///
/// Modified and added members are sent with empty headers and trailers, so a
/// [`TarArchiver`](crate::tar::TarArchiver) must follow if tar output is
/// wanted.
pub struct RecoveryInjector<S> {
    next: S,
    options: RecoveryOptions,
    skip_member: bool,
    in_auto_conf: bool,
    found_auto_conf: bool,
    member: Member,
}

impl<S: Streamer> RecoveryInjector<S> {
    pub fn new(next: S, options: RecoveryOptions) -> Self {
        Self {
            next,
            options,
            skip_member: false,
            in_auto_conf: false,
            found_auto_conf: false,
            member: Member::default(),
        }
    }

    fn header(&mut self, member: &Member, data: &[u8]) -> Result<()> {
        self.skip_member = false;
        self.in_auto_conf = false;

        let replaced = if self.options.modern {
            member.pathname == STANDBY_SIGNAL
        } else {
            member.pathname == RECOVERY_CONF
        };
        if replaced {
            debug!("dropping {} from archive", member.pathname);
            self.skip_member = true;
            return Ok(());
        }

        if self.options.modern && member.pathname == AUTO_CONF {
            debug!(
                "appending {} bytes of recovery settings to {AUTO_CONF}",
                self.options.content.len()
            );
            self.in_auto_conf = true;
            self.found_auto_conf = true;
            self.member = Member {
                size: member.size + self.options.content.len() as u64,
                ..member.clone()
            };
            // the header no longer matches; downstream regenerates it
            return self.next.content(Chunk::MemberHeader(&self.member, &[]));
        }

        self.next.content(Chunk::MemberHeader(member, data))
    }
}

impl<S: Streamer> Streamer for RecoveryInjector<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        match chunk {
            Chunk::Unknown(_) => Err(Error::UnexpectedChunk(chunk.context())),

            Chunk::MemberHeader(member, data) => self.header(member, data),

            Chunk::MemberContents(..) | Chunk::MemberTrailer(..) if self.skip_member => Ok(()),

            Chunk::MemberContents(_, data) if self.in_auto_conf => self
                .next
                .content(Chunk::MemberContents(&self.member, data)),

            Chunk::MemberTrailer(_, data) if self.in_auto_conf => {
                self.in_auto_conf = false;
                self.next.content(Chunk::MemberContents(
                    &self.member,
                    &self.options.content,
                ))?;
                self.next.content(Chunk::MemberTrailer(&self.member, data))
            }

            Chunk::MemberContents(..) | Chunk::MemberTrailer(..) => self.next.content(chunk),

            Chunk::ArchiveTrailer(_) => {
                if self.options.modern {
                    if !self.found_auto_conf {
                        inject_file(&mut self.next, AUTO_CONF, &self.options.content)?;
                    }
                    inject_file(&mut self.next, STANDBY_SIGNAL, &[])?;
                } else {
                    inject_file(&mut self.next, RECOVERY_CONF, &self.options.content)?;
                }
                self.next.content(chunk)
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.next.finalize()
    }
}

/// Sends a complete regular file member downstream.
///
/// The header and trailer events carry no bytes; a later stage has to build
/// them for whatever archive format it writes.
pub fn inject_file(next: &mut impl Streamer, pathname: &str, data: &[u8]) -> Result<()> {
    let member = Member {
        pathname: pathname.to_string(),
        size: data.len() as u64,
        mode: PG_FILE_CREATE_MODE,
        uid: INJECTED_UID,
        gid: INJECTED_GID,
        is_directory: false,
        is_link: false,
        linktarget: String::new(),
    };
    debug!("injecting {pathname} ({} bytes)", data.len());

    next.content(Chunk::MemberHeader(&member, &[]))?;
    next.content(Chunk::MemberContents(&member, data))?;
    next.content(Chunk::MemberTrailer(&member, &[]))
}
