//! Runtime verification of the typed chunk stream.

use log::trace;

use crate::{
    error::{Error, Result},
    streamer::{pad, Chunk, Member, Streamer},
};

#[derive(Debug)]
enum State {
    BetweenMembers,
    InMember {
        member: Member,
        header_replaced: bool,
        received: u64,
    },
    Finished,
}

/// A pass-through stage that fails on the first event breaking the rules
/// typed streams follow.
///
/// Each member is one header, any number of contents events adding up to the
/// member's size and one trailer, all carrying the same descriptor. The
/// archive trailer comes once, after the last member. Trailers after an
/// unchanged header must be exactly the tar padding for the member's size.
pub struct ContractChecker<S> {
    next: S,
    state: State,
    members: usize,
}

fn violation(message: String) -> Error {
    Error::ContractViolation(message)
}

impl<S: Streamer> ContractChecker<S> {
    pub fn new(next: S) -> Self {
        Self {
            next,
            state: State::BetweenMembers,
            members: 0,
        }
    }

    fn check(&mut self, chunk: &Chunk<'_>) -> Result<()> {
        let context = chunk.context();
        let state = std::mem::replace(&mut self.state, State::Finished);

        self.state = match (state, *chunk) {
            (_, Chunk::Unknown(_)) => {
                return Err(violation("untyped bytes on a typed stream".to_string()))
            }

            (State::BetweenMembers, Chunk::MemberHeader(member, data)) => {
                if !data.is_empty() && data.len() != crate::tar::BLOCK_SIZE {
                    return Err(violation(format!(
                        "header of {} is {} bytes",
                        member.pathname,
                        data.len()
                    )));
                }
                self.members += 1;
                State::InMember {
                    member: member.clone(),
                    header_replaced: data.is_empty(),
                    received: 0,
                }
            }

            (State::BetweenMembers, Chunk::ArchiveTrailer(_)) => State::Finished,

            (
                State::InMember {
                    member,
                    header_replaced,
                    received,
                },
                Chunk::MemberContents(current, data) | Chunk::MemberTrailer(current, data),
            ) => {
                if current != &member {
                    return Err(violation(format!(
                        "descriptor of {} changed within the member",
                        member.pathname
                    )));
                }

                if let Chunk::MemberContents(..) = chunk {
                    let received = received + data.len() as u64;
                    if received > member.size {
                        return Err(violation(format!(
                            "{} has more than its {} bytes of contents",
                            member.pathname, member.size
                        )));
                    }
                    State::InMember {
                        member,
                        header_replaced,
                        received,
                    }
                } else {
                    if received != member.size {
                        return Err(violation(format!(
                            "{} ended after {received} of {} bytes",
                            member.pathname, member.size
                        )));
                    }
                    if !header_replaced && data.len() != pad(member.size) {
                        return Err(violation(format!(
                            "trailer of {} is {} bytes, expected {}",
                            member.pathname,
                            data.len(),
                            pad(member.size)
                        )));
                    }
                    State::BetweenMembers
                }
            }

            (State::InMember { member, .. }, _) => {
                return Err(violation(format!(
                    "{context} event inside member {}",
                    member.pathname
                )))
            }

            (State::BetweenMembers, _) => {
                return Err(violation(format!("{context} event outside of a member")))
            }

            (State::Finished, _) => {
                return Err(violation(format!("{context} event after the archive trailer")))
            }
        };
        Ok(())
    }
}

impl<S: Streamer> Streamer for ContractChecker<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        self.check(&chunk)?;
        trace!("{} event ok", chunk.context());
        self.next.content(chunk)
    }

    fn finalize(&mut self) -> Result<()> {
        if !matches!(self.state, State::Finished) {
            return Err(violation(
                "stream finalized before the archive trailer".to_string(),
            ));
        }
        trace!("stream of {} members ok", self.members);
        self.next.finalize()
    }
}
