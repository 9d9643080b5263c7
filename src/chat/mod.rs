//! Chat sessions.
//!
//! Every turn re-applies the model's chat template to the whole history and
//! feeds the engine only the part of the formatted transcript it has not
//! seen yet. `prev_len` is the byte length of the transcript already
//! consumed; it is recomputed from the template without the generation
//! prompt once the assistant reply has been appended.

pub mod fragment;
pub mod store;
pub mod stream;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::engine::{
    Batch, ChatMessage, Context, Model, Pos, Role, SamplerStage, SeqId, Token, DEFAULT_SEED,
};
use crate::error::{Error, Result};
use crate::session::{Sampler, Session};

pub use fragment::FragmentDecoder;
pub use store::{ChatRecord, ChatStore, MemoryChatStore, MessageRecord};
pub use stream::ChatStream;

const CHAT_SEQ: SeqId = 0;

/// Conversation state attached to a session's context.
#[derive(Debug)]
pub struct ChatState {
    id: Uuid,
    messages: Vec<ChatMessage>,
    template: Option<String>,
    formatted: Buffer,
    prev_len: usize,
    response: Buffer,
}

impl ChatState {
    fn new(template: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            messages: Vec::new(),
            template,
            formatted: Buffer::new(),
            prev_len: 0,
            response: Buffer::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Bytes of the formatted transcript already fed to the engine.
    pub fn prev_len(&self) -> usize {
        self.prev_len
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Marks the transcript as unconsumed. The next turn clears the cache
    /// and feeds the whole history again.
    pub(crate) fn invalidate(&mut self) {
        self.prev_len = 0;
        self.formatted.reset();
    }
}

/// One in-flight user -> assistant exchange.
#[derive(Debug)]
pub(crate) struct Turn {
    /// History length and first cache position before the turn began.
    n_messages: usize,
    pos0: Pos,
    batch: Batch,
    next_pos: Pos,
    decoder: FragmentDecoder,
    n_generated: usize,
    done: bool,
}

impl Turn {
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn n_generated(&self) -> usize {
        self.n_generated
    }
}

struct ChatParts<'a> {
    model: Arc<dyn Model>,
    ctx: &'a mut Box<dyn Context>,
    sampler: &'a mut Sampler,
    chat: &'a mut ChatState,
}

impl Session {
    /// Starts a new conversation on the current context.
    ///
    /// Any previous conversation, including its system prompt, is dropped.
    /// When no sampler stages are configured, min-p, temperature and dist
    /// stages are added.
    pub fn chat_create(&mut self) -> Result<Uuid> {
        let template = self.model()?.chat_template();
        if self.context.is_none() {
            return Err(Error::no_context());
        }

        self.chat = None;
        if let Some(ctx) = self.context.as_mut() {
            ctx.memory_clear();
        }

        if self.sampler.as_ref().map_or(true, Sampler::is_empty) {
            self.add_sampler_stage(SamplerStage::MinP {
                p: 0.05,
                min_keep: 1,
            })?;
            self.add_sampler_stage(SamplerStage::Temp { t: 0.8 })?;
            self.add_sampler_stage(SamplerStage::Dist { seed: DEFAULT_SEED })?;
        }
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
        }

        let state = ChatState::new(template);
        let id = state.id;
        self.chat = Some(state);
        info!(%id, "chat created");
        Ok(id)
    }

    pub fn chat_free(&mut self) {
        if self.chat.take().is_some() {
            if let Some(ctx) = self.context.as_mut() {
                ctx.memory_clear();
            }
            debug!("chat freed");
        }
    }

    pub fn chat(&self) -> Result<&ChatState> {
        self.chat.as_ref().ok_or_else(Error::no_chat)
    }

    pub fn chat_system_prompt(&self) -> Result<Option<String>> {
        Ok(self.chat()?.system_prompt().map(str::to_string))
    }

    /// Sets the leading system turn, replacing an existing one.
    ///
    /// If the conversation has already started, the cache is cleared so the
    /// next turn re-feeds the whole transcript.
    pub fn set_chat_system_prompt(&mut self, prompt: &str) -> Result<()> {
        let chat = self.chat.as_mut().ok_or_else(Error::no_chat)?;
        let started = chat.messages.iter().any(|m| m.role != Role::System);

        match chat.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = prompt.to_string(),
            _ => chat
                .messages
                .insert(0, ChatMessage::new(Role::System, prompt)),
        }

        if started {
            chat.invalidate();
        }
        Ok(())
    }

    /// Generates the full assistant reply to `text`.
    ///
    /// A failed turn leaves the conversation and the cache as they were
    /// before the call.
    pub fn chat_respond(&mut self, text: &str) -> Result<String> {
        let mut turn = self.begin_turn(text)?;
        let reply = self.run_turn(&mut turn);
        if reply.is_err() {
            self.abort_turn(&turn);
        }
        reply
    }

    fn run_turn(&mut self, turn: &mut Turn) -> Result<String> {
        while self.chat_step(turn)?.is_some() {}
        self.finish_turn(turn)
    }

    /// Streams the assistant reply to `text` one fragment at a time.
    pub fn chat_stream(&mut self, text: &str) -> Result<ChatStream<'_>> {
        let turn = self.begin_turn(text)?;
        Ok(ChatStream::new(self, turn))
    }

    /// Appends a snapshot of the conversation to `store` and returns its
    /// identifier.
    pub fn chat_save(
        &self,
        store: &mut dyn ChatStore,
        title: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<Uuid> {
        let chat = self.chat()?;
        store.save(chat.id, title, metadata, &chat.messages)?;
        info!(id = %chat.id, messages = chat.messages.len(), "chat saved");
        Ok(chat.id)
    }

    /// Replaces the current conversation with a saved one. The transcript
    /// is fed to the engine again on the next turn.
    pub fn chat_restore(&mut self, store: &dyn ChatStore, uuid: &str) -> Result<()> {
        let id = Uuid::parse_str(uuid.trim()).map_err(|e| {
            Error::InvalidArgument(format!("Invalid chat identifier '{}': {}", uuid, e))
        })?;
        let messages = store.load(&id)?;
        self.chat_create()?;
        let chat = self.chat.as_mut().ok_or_else(Error::no_chat)?;
        chat.id = id;
        chat.messages = messages;
        info!(%id, messages = chat.messages.len(), "chat restored");
        Ok(())
    }

    fn chat_parts(&mut self) -> Result<ChatParts<'_>> {
        let model = Arc::clone(self.model.as_ref().ok_or_else(Error::no_model)?);
        let chat = self.chat.as_mut().ok_or_else(Error::no_chat)?;
        let ctx = self.context.as_mut().ok_or_else(Error::no_context)?;
        let sampler = self.sampler.as_mut().ok_or_else(Error::no_sampler)?;
        Ok(ChatParts {
            model,
            ctx,
            sampler,
            chat,
        })
    }

    /// Appends the user turn and prepares the batch holding the new part of
    /// the transcript.
    pub(crate) fn begin_turn(&mut self, text: &str) -> Result<Turn> {
        let ChatParts {
            model, ctx, chat, ..
        } = self.chat_parts()?;

        if chat.prev_len == 0 {
            ctx.memory_clear();
        }
        let n_messages = chat.messages.len();
        chat.response.reset();
        chat.messages.push(ChatMessage::new(Role::User, text));

        let pos0 = ctx.memory_seq_pos_max(CHAT_SEQ) + 1;
        let prepared = prepare_prompt(&*model, &**ctx, chat)
            .and_then(|tokens| Batch::sequence(&tokens, pos0, CHAT_SEQ, true));
        let batch = match prepared {
            Ok(batch) => batch,
            Err(e) => {
                chat.messages.truncate(n_messages);
                return Err(e);
            }
        };

        debug!(
            prev_len = chat.prev_len,
            formatted_len = chat.formatted.len(),
            tokens = batch.len(),
            pos0,
            "chat turn prepared"
        );
        Ok(Turn {
            n_messages,
            pos0,
            next_pos: pos0 + batch.len() as Pos,
            batch,
            decoder: FragmentDecoder::new(),
            n_generated: 0,
            done: false,
        })
    }

    /// One decode and sample step. Returns the decoded fragment, or `None`
    /// once the model produced an end-of-generation token.
    pub(crate) fn chat_step(&mut self, turn: &mut Turn) -> Result<Option<String>> {
        if turn.done {
            return Ok(None);
        }
        let ChatParts {
            model,
            ctx,
            sampler,
            chat,
        } = self.chat_parts()?;

        let n_ctx = ctx.n_ctx() as usize;
        let used = (ctx.memory_seq_pos_max(CHAT_SEQ) + 1).max(0) as usize;
        if used + turn.batch.len() > n_ctx {
            return Err(Error::TooBig(format!(
                "Context size exceeded: {} cached and {} pending tokens do not fit in context_size {}.",
                used,
                turn.batch.len(),
                n_ctx
            )));
        }

        ctx.decode(&turn.batch)
            .map_err(|e| Error::engine("decode", e))?;
        let token = sampler.sample(&**ctx, -1)?;

        if model.is_eog(token) {
            turn.done = true;
            let rest = turn.decoder.finish();
            if rest.is_empty() {
                return Ok(None);
            }
            chat.response.append_str(&rest)?;
            return Ok(Some(rest));
        }

        let piece = model.token_to_piece(token, true);
        let fragment = turn.decoder.push(&piece);
        chat.response.append_str(&fragment)?;

        turn.batch.clear();
        turn.batch.push(token, turn.next_pos, CHAT_SEQ, true);
        turn.next_pos += 1;
        turn.n_generated += 1;
        Ok(Some(fragment))
    }

    /// Appends the assistant reply to the history and advances `prev_len`.
    pub(crate) fn finish_turn(&mut self, turn: &mut Turn) -> Result<String> {
        let ChatParts { model, chat, .. } = self.chat_parts()?;

        let rest = turn.decoder.finish();
        if !rest.is_empty() {
            chat.response.append_str(&rest)?;
        }
        let reply = chat.response.to_string_lossy();
        chat.messages
            .push(ChatMessage::new(Role::Assistant, reply.clone()));

        let formatted = model
            .apply_chat_template(chat.template.as_deref(), &chat.messages, false)
            .map_err(|e| Error::engine("apply_chat_template", e))?;
        chat.formatted.set(formatted.as_bytes())?;
        chat.prev_len = formatted.len();

        debug!(
            prev_len = chat.prev_len,
            generated = turn.n_generated,
            "chat turn finished"
        );
        Ok(reply)
    }
}

impl Session {
    /// Undoes a turn that failed part way: the user message and any partial
    /// reply are dropped and the cache is cut back to where the turn began.
    pub(crate) fn abort_turn(&mut self, turn: &Turn) {
        let Some(chat) = self.chat.as_mut() else {
            return;
        };
        chat.messages.truncate(turn.n_messages);
        chat.response.reset();

        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if !ctx.memory_seq_rm(CHAT_SEQ, turn.pos0, -1) {
            ctx.memory_clear();
            chat.invalidate();
        }
        debug!(pos0 = turn.pos0, "chat turn rolled back");
    }
}

/// Formats the full history with the generation prompt and tokenizes the
/// part past `prev_len`. Only the first prompt of an empty cache gets the
/// leading special token.
fn prepare_prompt(
    model: &dyn Model,
    ctx: &dyn Context,
    chat: &mut ChatState,
) -> Result<Vec<Token>> {
    let formatted = model
        .apply_chat_template(chat.template.as_deref(), &chat.messages, true)
        .map_err(|e| Error::engine("apply_chat_template", e))?;
    chat.formatted.set(formatted.as_bytes())?;

    let delta = String::from_utf8_lossy(chat.formatted.tail(chat.prev_len)).into_owned();
    let first = ctx.memory_seq_pos_max(CHAT_SEQ) < 0;
    let tokens = model
        .tokenize(&delta, first, true)
        .map_err(|e| Error::engine("tokenize", e))?;
    if tokens.is_empty() {
        return Err(Error::InvalidArgument(
            "The chat message produced no tokens.".to_string(),
        ));
    }
    Ok(tokens)
}
