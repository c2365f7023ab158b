use std::fmt;

/// Broadcast target: deliver to every rank, including local delivery.
pub const ALL: i32 = -1;

/// Wildcard dependency source: matches an event from any rank.
pub const ANY: i32 = -2;

/// Loopback target, resolved to the local rank by the messaging layer.
pub const SELF_RANK: i32 = -3;

/// First tag value handed out for user-defined context regions. Everything
/// below is reserved for the built-in type set.
pub(crate) const CONTEXT_TAG_BASE: i32 = 2048;

/// The closed set of event payload types.
///
/// `Address` is pointer-width, `None` is zero-length. Context-region events
/// travel with their own tag (>= `CONTEXT_TAG_BASE`) and carry a
/// pointer-sized address into process-local memory.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    None = 0,
    Int = 1,
    Float = 2,
    Double = 3,
    Byte = 4,
    Address = 5,
    Long = 6,
}

impl EventType {
    /// Size in bytes of one element of this type.
    pub fn element_size(self) -> usize {
        match self {
            EventType::None => 0,
            EventType::Int | EventType::Float => 4,
            EventType::Double | EventType::Long => 8,
            EventType::Byte => 1,
            EventType::Address => std::mem::size_of::<usize>(),
        }
    }

    pub(crate) fn from_tag(tag: i32) -> Option<EventType> {
        match tag {
            0 => Some(EventType::None),
            1 => Some(EventType::Int),
            2 => Some(EventType::Float),
            3 => Some(EventType::Double),
            4 => Some(EventType::Byte),
            5 => Some(EventType::Address),
            6 => Some(EventType::Long),
            _ => None,
        }
    }
}

/// Typed payload handed to [`fire_event`](crate::Handle::fire_event).
///
/// Converted once into the raw little-endian buffer an [`Event`] owns; the
/// buffer moves with the event until the consuming task drops it.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    None,
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Byte(Vec<u8>),
    Long(Vec<i64>),
    Address(usize),
}

impl Payload {
    pub fn from_i32s(values: &[i32]) -> Payload {
        Payload::Int(values.to_vec())
    }

    pub fn from_f32s(values: &[f32]) -> Payload {
        Payload::Float(values.to_vec())
    }

    pub fn from_f64s(values: &[f64]) -> Payload {
        Payload::Double(values.to_vec())
    }

    pub fn from_bytes(values: &[u8]) -> Payload {
        Payload::Byte(values.to_vec())
    }

    pub fn from_i64s(values: &[i64]) -> Payload {
        Payload::Long(values.to_vec())
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Payload::None => EventType::None,
            Payload::Int(_) => EventType::Int,
            Payload::Float(_) => EventType::Float,
            Payload::Double(_) => EventType::Double,
            Payload::Byte(_) => EventType::Byte,
            Payload::Long(_) => EventType::Long,
            Payload::Address(_) => EventType::Address,
        }
    }

    pub fn element_count(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Int(v) => v.len(),
            Payload::Float(v) => v.len(),
            Payload::Double(v) => v.len(),
            Payload::Byte(v) => v.len(),
            Payload::Long(v) => v.len(),
            Payload::Address(_) => 1,
        }
    }

    /// Encode into the raw buffer an event owns. `None` payloads own no
    /// buffer at all.
    pub(crate) fn into_bytes(self) -> Option<Box<[u8]>> {
        fn collect<T, F: Fn(T, &mut Vec<u8>)>(values: Vec<T>, width: usize, f: F) -> Box<[u8]> {
            let mut buf = Vec::with_capacity(values.len() * width);
            for v in values {
                f(v, &mut buf);
            }
            buf.into_boxed_slice()
        }

        match self {
            Payload::None => None,
            Payload::Int(v) => Some(collect(v, 4, |x, b| b.extend_from_slice(&x.to_le_bytes()))),
            Payload::Float(v) => Some(collect(v, 4, |x, b| b.extend_from_slice(&x.to_le_bytes()))),
            Payload::Double(v) => Some(collect(v, 8, |x, b| b.extend_from_slice(&x.to_le_bytes()))),
            Payload::Byte(v) => Some(v.into_boxed_slice()),
            Payload::Long(v) => Some(collect(v, 8, |x, b| b.extend_from_slice(&x.to_le_bytes()))),
            Payload::Address(a) => Some(a.to_le_bytes().to_vec().into_boxed_slice()),
        }
    }
}

/// A typed, named, one-shot value with a source rank.
///
/// The event owns its payload buffer; ownership transfers to the consuming
/// task (persistent events hand each consumer its own copy).
#[derive(Clone)]
pub struct Event {
    source: i32,
    elements: usize,
    etype: EventType,
    /// Raw tag as it travels on the wire. Differs from `etype as i32` only
    /// for context-region events.
    tag: i32,
    persistent: bool,
    id: String,
    data: Option<Box<[u8]>>,
}

impl Event {
    pub(crate) fn new(source: i32, persistent: bool, id: String, payload: Payload) -> Event {
        let etype = payload.event_type();
        let elements = payload.element_count();
        Event {
            source,
            elements,
            etype,
            tag: etype as i32,
            persistent,
            id,
            data: payload.into_bytes(),
        }
    }

    /// An event whose payload is the address of a process-local context
    /// region. The region itself never travels.
    pub(crate) fn new_context(source: i32, id: String, tag: i32, address: usize) -> Event {
        Event {
            source,
            elements: 1,
            etype: EventType::Address,
            tag,
            persistent: false,
            id,
            data: Some(address.to_le_bytes().to_vec().into_boxed_slice()),
        }
    }

    pub(crate) fn from_wire(
        source: i32,
        tag: i32,
        persistent: bool,
        id: String,
        data: Option<Box<[u8]>>,
    ) -> Option<Event> {
        let (etype, is_context) = if tag >= CONTEXT_TAG_BASE {
            (EventType::Address, true)
        } else {
            (EventType::from_tag(tag)?, false)
        };
        let raw_len = data.as_ref().map_or(0, |d| d.len());
        let elements = if is_context || etype == EventType::None {
            if is_context {
                1
            } else {
                0
            }
        } else {
            raw_len / etype.element_size().max(1)
        };
        Some(Event {
            source,
            elements,
            etype,
            tag,
            persistent,
            id,
            data,
        })
    }

    pub fn source(&self) -> i32 {
        self.source
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> EventType {
        self.etype
    }

    pub(crate) fn type_tag(&self) -> i32 {
        self.tag
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_context(&self) -> bool {
        self.tag >= CONTEXT_TAG_BASE
    }

    /// Logical element count (0 for `None`-typed events).
    pub fn element_count(&self) -> usize {
        if self.etype == EventType::None {
            0
        } else {
            self.elements
        }
    }

    /// Length in bytes of the owned payload buffer.
    pub fn raw_data_length(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Address of the context region this event refers to.
    pub fn context_address(&self) -> Option<usize> {
        if !self.is_context() {
            return None;
        }
        let data = self.data.as_ref()?;
        let mut word = [0u8; std::mem::size_of::<usize>()];
        let len = word.len();
        word.copy_from_slice(&data[..len]);
        Some(usize::from_le_bytes(word))
    }

    pub fn as_i32s(&self) -> Option<Vec<i32>> {
        self.decode(EventType::Int, |c| i32::from_le_bytes(c.try_into().unwrap()))
    }

    pub fn as_f32s(&self) -> Option<Vec<f32>> {
        self.decode(EventType::Float, |c| f32::from_le_bytes(c.try_into().unwrap()))
    }

    pub fn as_f64s(&self) -> Option<Vec<f64>> {
        self.decode(EventType::Double, |c| f64::from_le_bytes(c.try_into().unwrap()))
    }

    pub fn as_i64s(&self) -> Option<Vec<i64>> {
        self.decode(EventType::Long, |c| i64::from_le_bytes(c.try_into().unwrap()))
    }

    fn decode<T, F: Fn(&[u8]) -> T>(&self, want: EventType, f: F) -> Option<Vec<T>> {
        if self.etype != want || self.is_context() {
            return None;
        }
        let data = self.data.as_deref()?;
        Some(data.chunks_exact(want.element_size()).map(f).collect())
    }

    /// The (id, source) pair this event is matched under.
    pub fn key(&self) -> DependencyKey {
        DependencyKey::new(self.source, &self.id)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("type", &self.etype)
            .field("elements", &self.elements)
            .field("raw_len", &self.raw_data_length())
            .field("persistent", &self.persistent)
            .field("context", &self.is_context())
            .finish()
    }
}

/// (event-id, source-rank) pair used to match events to task dependencies.
///
/// The rank may be the [`ANY`] wildcard. Wildcard equality is deliberately an
/// explicit method rather than `PartialEq`: "`ANY` equals every rank on the
/// same id" is not transitive, so it cannot back an `Ord`/`Hash` impl without
/// corrupting ordered containers. Structural equality stays derived.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DependencyKey {
    id: String,
    rank: i32,
}

impl DependencyKey {
    pub fn new(rank: i32, id: &str) -> DependencyKey {
        DependencyKey {
            id: id.to_string(),
            rank,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn is_wildcard(&self) -> bool {
        self.rank == ANY
    }

    /// Equality with wildcard semantics: ids must match and either rank is
    /// `ANY` or the ranks are equal.
    pub fn matches(&self, other: &DependencyKey) -> bool {
        self.id == other.id
            && (self.rank == ANY || other.rank == ANY || self.rank == other.rank)
    }

    /// Whether an event with this source rank satisfies the key.
    pub fn matches_source(&self, source: i32) -> bool {
        self.rank == ANY || self.rank == source
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rank == ANY {
            write!(f, "{}@any", self.id)
        } else {
            write!(f, "{}@{}", self.id, self.rank)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Event: Send, Sync, Clone);
    assert_impl_all!(DependencyKey: Send, Sync, Clone);

    #[test]
    fn payload_round_trip_int() {
        let event = Event::new(3, false, "e".into(), Payload::from_i32s(&[1, -2, 3]));
        assert_eq!(event.element_count(), 3);
        assert_eq!(event.raw_data_length(), 12);
        assert_eq!(event.as_i32s().unwrap(), vec![1, -2, 3]);
        assert!(event.as_f64s().is_none());
    }

    #[test]
    fn none_payload_is_empty() {
        let event = Event::new(0, false, "sig".into(), Payload::None);
        assert_eq!(event.element_count(), 0);
        assert_eq!(event.raw_data_length(), 0);
        assert!(event.bytes().is_none());
    }

    #[test]
    fn raw_length_matches_element_count() {
        for payload in [
            Payload::from_i32s(&[1, 2]),
            Payload::from_f64s(&[0.5]),
            Payload::from_bytes(b"abc"),
            Payload::from_i64s(&[7, 8, 9]),
        ] {
            let etype = payload.event_type();
            let count = payload.element_count();
            let event = Event::new(0, false, "x".into(), payload);
            assert_eq!(event.raw_data_length(), count * etype.element_size());
        }
    }

    #[test]
    fn context_event_carries_address() {
        let event = Event::new_context(1, "ctx".into(), CONTEXT_TAG_BASE + 4, 0xdead_beef);
        assert!(event.is_context());
        assert_eq!(event.context_address(), Some(0xdead_beef));
        assert_eq!(event.raw_data_length(), std::mem::size_of::<usize>());
    }

    #[test]
    fn wildcard_key_matches_any_rank() {
        let any = DependencyKey::new(ANY, "q");
        let one = DependencyKey::new(1, "q");
        let two = DependencyKey::new(2, "q");
        assert!(any.matches(&one));
        assert!(one.matches(&any));
        assert!(!one.matches(&two));
        assert!(!any.matches(&DependencyKey::new(1, "other")));
        assert!(any.matches_source(7));
        assert!(!one.matches_source(7));
    }

    #[test]
    fn type_tags_round_trip() {
        for tag in 0..=6 {
            let etype = EventType::from_tag(tag).unwrap();
            assert_eq!(etype as i32, tag);
        }
        assert!(EventType::from_tag(7).is_none());
        assert!(EventType::from_tag(-1).is_none());
    }
}
