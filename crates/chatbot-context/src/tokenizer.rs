//! Tokenizers per model family.
//!
//! BPE tables are loaded once per process. Callers hold a [`TokenizerLease`]
//! for the duration of one chat request; the lease is released when it is
//! dropped, on every exit path.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::error::{ContextError, ContextResult};

const CL100K_SPECIAL: &[(&str, u32)] = &[
    ("<|endoftext|>", 100_257),
    ("<|fim_prefix|>", 100_258),
    ("<|fim_middle|>", 100_259),
    ("<|fim_suffix|>", 100_260),
    ("<|endofprompt|>", 100_276),
];

const CHATML_SPECIAL: &[(&str, u32)] = &[
    ("<|endoftext|>", 100_257),
    ("<|fim_prefix|>", 100_258),
    ("<|fim_middle|>", 100_259),
    ("<|fim_suffix|>", 100_260),
    ("<|im_start|>", 100_264),
    ("<|im_end|>", 100_265),
    ("<|im_sep|>", 100_266),
    ("<|endofprompt|>", 100_276),
];

const P50K_SPECIAL: &[(&str, u32)] = &[("<|endoftext|>", 50_256)];

/// BPE vocabulary used for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// `cl100k_base` extended with the ChatML turn markers.
    Cl100kChatMl,
    Cl100k,
    P50k,
}

impl Encoding {
    /// Picks the encoding for a model id. Azure `gpt-35` ids are treated as
    /// `gpt-3.5`; models without a dedicated vocabulary use `cl100k_base`.
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.replace("gpt-35", "gpt-3.5");
        if id.contains("text-davinci-") {
            Self::P50k
        } else if id.contains("gpt-3.5") || id.contains("gpt-4") {
            Self::Cl100kChatMl
        } else {
            Self::Cl100k
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cl100kChatMl => "cl100k_base+chatml",
            Self::Cl100k => "cl100k_base",
            Self::P50k => "p50k_base",
        }
    }

    pub fn special_tokens(&self) -> &'static [(&'static str, u32)] {
        match self {
            Self::Cl100kChatMl => CHATML_SPECIAL,
            Self::Cl100k => CL100K_SPECIAL,
            Self::P50k => P50K_SPECIAL,
        }
    }
}

/// Which special markers are encoded as single special tokens.
/// Markers that are not allowed are encoded as ordinary text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedSpecial {
    All,
    Only(Vec<String>),
}

impl AllowedSpecial {
    pub fn none() -> Self {
        Self::Only(Vec::new())
    }

    fn allows(&self, marker: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(list) => list.iter().any(|allowed| allowed == marker),
        }
    }
}

/// Deterministic text encoder for a model family.
pub trait Tokenizer: Send + Sync {
    fn encoding(&self) -> Encoding;

    fn encode(&self, text: &str, allowed: &AllowedSpecial) -> Vec<u32>;

    fn count(&self, text: &str, allowed: &AllowedSpecial) -> usize {
        self.encode(text, allowed).len()
    }
}

fn shared_bpe(encoding: Encoding) -> ContextResult<Arc<CoreBPE>> {
    static CL100K: OnceLock<Arc<CoreBPE>> = OnceLock::new();
    static P50K: OnceLock<Arc<CoreBPE>> = OnceLock::new();

    let cell = match encoding {
        Encoding::P50k => &P50K,
        Encoding::Cl100k | Encoding::Cl100kChatMl => &CL100K,
    };
    if let Some(bpe) = cell.get() {
        return Ok(Arc::clone(bpe));
    }

    let loaded = match encoding {
        Encoding::P50k => tiktoken_rs::p50k_base(),
        Encoding::Cl100k | Encoding::Cl100kChatMl => tiktoken_rs::cl100k_base(),
    }
    .map_err(|err| ContextError::Tokenizer(err.to_string()))?;

    Ok(Arc::clone(cell.get_or_init(|| Arc::new(loaded))))
}

/// Byte-pair tokenizer backed by the tiktoken vocabularies.
#[derive(Clone)]
pub struct BpeTokenizer {
    encoding: Encoding,
    bpe: Arc<CoreBPE>,
}

impl BpeTokenizer {
    pub fn load(encoding: Encoding) -> ContextResult<Self> {
        Ok(Self {
            encoding,
            bpe: shared_bpe(encoding)?,
        })
    }

    fn encode_ordinary_into(&self, text: &str, out: &mut Vec<u32>) {
        if !text.is_empty() {
            out.extend(self.bpe.encode_ordinary(text).into_iter().map(|rank| rank as u32));
        }
    }
}

impl fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl Tokenizer for BpeTokenizer {
    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn encode(&self, text: &str, allowed: &AllowedSpecial) -> Vec<u32> {
        let specials: Vec<(&str, u32)> = self
            .encoding
            .special_tokens()
            .iter()
            .copied()
            .filter(|(marker, _)| allowed.allows(marker))
            .collect();

        let mut tokens = Vec::new();
        let mut rest = text;
        loop {
            let next = specials
                .iter()
                .filter_map(|&(marker, id)| rest.find(marker).map(|pos| (pos, marker, id)))
                .min_by_key(|&(pos, _, _)| pos);

            match next {
                Some((pos, marker, id)) => {
                    self.encode_ordinary_into(&rest[..pos], &mut tokens);
                    tokens.push(id);
                    rest = &rest[pos + marker.len()..];
                }
                None => {
                    self.encode_ordinary_into(rest, &mut tokens);
                    return tokens;
                }
            }
        }
    }
}

/// Hands out tokenizer leases and tracks how many are live.
#[derive(Debug, Clone, Default)]
pub struct Tokenizers {
    active: Arc<AtomicUsize>,
}

impl Tokenizers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the tokenizer for a model. Released when the lease drops.
    pub fn acquire(&self, model_id: &str) -> ContextResult<TokenizerLease> {
        let encoding = Encoding::for_model(model_id);
        let tokenizer = BpeTokenizer::load(encoding)?;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(model = model_id, encoding = encoding.name(), active, "tokenizer acquired");

        Ok(TokenizerLease {
            tokenizer,
            active: Arc::clone(&self.active),
        })
    }

    /// Number of leases not yet released.
    pub fn active_leases(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// A tokenizer scoped to a single request.
#[derive(Debug)]
pub struct TokenizerLease {
    tokenizer: BpeTokenizer,
    active: Arc<AtomicUsize>,
}

impl Tokenizer for TokenizerLease {
    fn encoding(&self) -> Encoding {
        self.tokenizer.encoding()
    }

    fn encode(&self, text: &str, allowed: &AllowedSpecial) -> Vec<u32> {
        self.tokenizer.encode(text, allowed)
    }
}

impl Drop for TokenizerLease {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(encoding = self.tokenizer.encoding().name(), remaining, "tokenizer released");
    }
}
