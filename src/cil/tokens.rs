//! Metadata tokens and the resolution collaborator
//!
//! The binary encoding never stores a type, method, field, signature, or string literal inline:
//! it stores an opaque 4-byte token assigned by whatever metadata store hosts the method. This
//! module defines the [`TokenResolver`] contract the codec talks to, plus two implementations: a
//! lock-guarded memoizing wrapper ([`CachingResolver`]) and a self-contained sequential table
//! ([`InMemoryTokenTable`]) that is enough for tests and for round trips that never leave this
//! crate.

use super::binary_format::Serialize;
use super::errors::Error;
use super::signature::{CilType, MethodSig};
use super::type_graph::{FieldId, MethodId};
use byteorder::WriteBytesExt;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Mutex;

/// Opaque 4-byte metadata token: table kind in the top byte, row index below
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Token(pub u32);

/// Metadata table kinds minted by [`InMemoryTokenTable`]
pub mod tables {
    pub const TYPE_REF: u8 = 0x01;
    pub const FIELD_DEF: u8 = 0x04;
    pub const MEMBER_REF: u8 = 0x0A;
    pub const STANDALONE_SIG: u8 = 0x11;
    pub const TYPE_SPEC: u8 = 0x1B;
    pub const USER_STRING: u8 = 0x70;
}

impl Token {
    pub fn new(table: u8, index: u32) -> Token {
        Token((table as u32) << 24 | (index & 0x00FF_FFFF))
    }

    /// Table kind (top byte)
    pub fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Row index (bottom three bytes)
    pub fn index(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
}

impl Serialize for Token {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.0.serialize(writer)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/* {:08X} */", self.0)
    }
}

/// An abstract reference to something living outside the method body
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ExternalRef<'g> {
    /// A type (used by `newarr`, `castclass`, `box`, `ldtoken`, ...)
    Type(CilType<'g>),

    /// A method or constructor
    Method(MethodId<'g>),

    /// A field
    Field(FieldId<'g>),

    /// A standalone call-site signature (the `calli` operand)
    StandaloneSig(MethodSig<'g>),

    /// An encoded local-variable signature blob (the fat header's signature field)
    LocalsSig(Vec<u8>),

    /// A string literal (the `ldstr` operand)
    Str(String),
}

impl<'g> fmt::Display for ExternalRef<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalRef::Type(ty) => write!(f, "{}", ty),
            ExternalRef::Method(method) => {
                write!(f, "{}::{}", method.owner.name, method.name)
            }
            ExternalRef::Field(field) => write!(f, "{}::{}", field.owner.name, field.name),
            ExternalRef::StandaloneSig(sig) => write!(f, "sig {}", sig),
            ExternalRef::LocalsSig(blob) => write!(f, "locals-sig ({} bytes)", blob.len()),
            ExternalRef::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Maps abstract references to the opaque tokens used in the binary encoding, and back
///
/// The resolver decides the numeric encoding; the codec only knows "ask the resolver, write 4
/// bytes". Implementations must be idempotent for the same input within one method-body bake.
pub trait TokenResolver<'g> {
    fn token_of(&self, external: &ExternalRef<'g>) -> Result<Token, Error>;

    fn resolve(&self, token: Token) -> Result<ExternalRef<'g>, Error>;
}

/// Memoizing wrapper around another resolver
///
/// Lookups for a given reference hit the underlying resolver at most once. The cache is guarded
/// by a lock, so concurrent first-lookups for the same key block rather than race.
pub struct CachingResolver<'g, R> {
    inner: R,
    forward: Mutex<HashMap<ExternalRef<'g>, Token>>,
    backward: Mutex<HashMap<Token, ExternalRef<'g>>>,
}

impl<'g, R: TokenResolver<'g>> CachingResolver<'g, R> {
    pub fn new(inner: R) -> CachingResolver<'g, R> {
        CachingResolver {
            inner,
            forward: Mutex::new(HashMap::new()),
            backward: Mutex::new(HashMap::new()),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<'g, R: TokenResolver<'g>> TokenResolver<'g> for CachingResolver<'g, R> {
    fn token_of(&self, external: &ExternalRef<'g>) -> Result<Token, Error> {
        let mut forward = self.forward.lock().expect("token cache poisoned");
        if let Some(token) = forward.get(external) {
            return Ok(*token);
        }
        let token = self.inner.token_of(external)?;
        forward.insert(external.clone(), token);
        Ok(token)
    }

    fn resolve(&self, token: Token) -> Result<ExternalRef<'g>, Error> {
        let mut backward = self.backward.lock().expect("token cache poisoned");
        if let Some(external) = backward.get(&token) {
            return Ok(external.clone());
        }
        let external = self.inner.resolve(token)?;
        backward.insert(token, external.clone());
        Ok(external)
    }
}

/// Self-contained resolver assigning sequential row indices per table kind
///
/// This stands in for a real metadata store: every distinct reference gets a fresh row in the
/// table matching its kind, and the same reference always gets the same token back.
pub struct InMemoryTokenTable<'g> {
    state: Mutex<TableState<'g>>,
}

struct TableState<'g> {
    by_ref: HashMap<ExternalRef<'g>, Token>,
    by_token: HashMap<Token, ExternalRef<'g>>,
    next_index: HashMap<u8, u32>,
}

impl<'g> InMemoryTokenTable<'g> {
    pub fn new() -> InMemoryTokenTable<'g> {
        InMemoryTokenTable {
            state: Mutex::new(TableState {
                by_ref: HashMap::new(),
                by_token: HashMap::new(),
                next_index: HashMap::new(),
            }),
        }
    }

    fn table_of(external: &ExternalRef<'g>) -> u8 {
        match external {
            ExternalRef::Type(_) => tables::TYPE_REF,
            ExternalRef::Method(_) => tables::MEMBER_REF,
            ExternalRef::Field(_) => tables::FIELD_DEF,
            ExternalRef::StandaloneSig(_) | ExternalRef::LocalsSig(_) => tables::STANDALONE_SIG,
            ExternalRef::Str(_) => tables::USER_STRING,
        }
    }
}

impl<'g> Default for InMemoryTokenTable<'g> {
    fn default() -> Self {
        InMemoryTokenTable::new()
    }
}

impl<'g> TokenResolver<'g> for InMemoryTokenTable<'g> {
    fn token_of(&self, external: &ExternalRef<'g>) -> Result<Token, Error> {
        let mut state = self.state.lock().expect("token table poisoned");
        if let Some(token) = state.by_ref.get(external) {
            return Ok(*token);
        }

        let table = Self::table_of(external);
        let index = state.next_index.entry(table).or_insert(1);
        let token = Token::new(table, *index);
        *index += 1;

        state.by_ref.insert(external.clone(), token);
        state.by_token.insert(token, external.clone());
        Ok(token)
    }

    fn resolve(&self, token: Token) -> Result<ExternalRef<'g>, Error> {
        let state = self.state.lock().expect("token table poisoned");
        state
            .by_token
            .get(&token)
            .cloned()
            .ok_or_else(|| Error::UnresolvedReference(format!("token {:08X}", token.0)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tokens_are_idempotent_per_reference() {
        let table = InMemoryTokenTable::new();
        let one = ExternalRef::Str("one".to_string());
        let two = ExternalRef::Str("two".to_string());

        let token_one = table.token_of(&one).unwrap();
        let token_two = table.token_of(&two).unwrap();
        assert_ne!(token_one, token_two);
        assert_eq!(table.token_of(&one).unwrap(), token_one);

        assert_eq!(token_one.table(), tables::USER_STRING);
        assert_eq!(token_one.index(), 1);
        assert_eq!(token_two.index(), 2);
    }

    #[test]
    fn tokens_resolve_back() {
        let table = InMemoryTokenTable::new();
        let sig = ExternalRef::LocalsSig(vec![0x07, 0x00]);
        let token = table.token_of(&sig).unwrap();
        assert_eq!(table.resolve(token).unwrap(), sig);

        let bogus = Token::new(tables::MEMBER_REF, 99);
        assert!(matches!(
            table.resolve(bogus),
            Err(Error::UnresolvedReference(_))
        ));
    }

    struct CountingResolver<'g> {
        hits: AtomicUsize,
        inner: InMemoryTokenTable<'g>,
    }

    impl<'g> TokenResolver<'g> for CountingResolver<'g> {
        fn token_of(&self, external: &ExternalRef<'g>) -> Result<Token, Error> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.inner.token_of(external)
        }

        fn resolve(&self, token: Token) -> Result<ExternalRef<'g>, Error> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(token)
        }
    }

    #[test]
    fn caching_resolver_hits_the_store_once_per_key() {
        let counting = CountingResolver {
            hits: AtomicUsize::new(0),
            inner: InMemoryTokenTable::new(),
        };
        let caching = CachingResolver::new(counting);

        let string_ref = ExternalRef::Str("interned".to_string());
        let first = caching.token_of(&string_ref).unwrap();
        let second = caching.token_of(&string_ref).unwrap();
        assert_eq!(first, second);
        assert_eq!(caching.into_inner().hits.load(Ordering::SeqCst), 1);
    }
}
