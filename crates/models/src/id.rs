/// Id is a stable, never-reused identifier for a record, specification,
/// molecule, or output blob. It is an opaque 8-byte value, displayed and
/// parsed as lowercase hex, and is never mutated or recycled once issued.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 8]);

impl Id {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    pub fn new(b: [u8; 8]) -> Self {
        Self(b)
    }

    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
        let vec_bytes = hex::decode(hex)?;
        let exact: [u8; 8] = vec_bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;

        Ok(Id(exact))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::from_hex(s)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", i64::from_be_bytes(self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::from_hex(str_val.as_ref()).map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Type<sqlx::Postgres> for Id {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Encode<'_, sqlx::Postgres> for Id {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        let v = i64::from_be_bytes(self.0);
        <i64 as sqlx::Encode<'_, sqlx::Postgres>>::encode_by_ref(&v, buf)
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Decode<'_, sqlx::Postgres> for Id {
    fn decode(
        value: sqlx::postgres::PgValueRef<'_>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let v = <i64 as sqlx::Decode<'_, sqlx::Postgres>>::decode(value)?;
        Ok(Id(v.to_be_bytes()))
    }
}

/// IdGenerator mints process-unique [`Id`] values without a round trip to
/// the database. Each generator is seeded with a 10-bit shard (distinct per
/// running server process) and packs a millisecond timestamp and a
/// per-millisecond sequence number around it, snowflake-style, so ids are
/// k-sortable by creation time and never collide across processes so long
/// as shards are distinct.
#[derive(Clone)]
pub struct IdGenerator {
    shard: u16,
    last_millis: u64,
    sequence: u16,
}

const SHARD_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;

impl IdGenerator {
    /// `shard` should be unique across concurrently-running server
    /// processes; it occupies the low 10 bits alongside a sequence counter.
    pub fn new(shard: u16) -> Self {
        Self {
            shard: shard & ((1 << SHARD_BITS) - 1),
            last_millis: 0,
            sequence: 0,
        }
    }

    pub fn next(&mut self) -> Id {
        let mut millis = current_millis();

        if millis == self.last_millis {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                // Exhausted this millisecond's sequence space; spin to the next one.
                while millis <= self.last_millis {
                    millis = current_millis();
                }
            }
        } else {
            self.sequence = 0;
        }
        self.last_millis = millis;

        let packed = (millis << (SHARD_BITS + SEQUENCE_BITS))
            | ((self.shard as u64) << SEQUENCE_BITS)
            | (self.sequence as u64);

        Id((packed as i64).to_be_bytes())
    }
}

fn current_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique_within_a_shard() {
        let mut gen = IdGenerator::new(7);
        let mut prior = gen.next();
        for _ in 0..10_000 {
            let next = gen.next();
            assert!(next > prior, "ids must be strictly increasing");
            prior = next;
        }
    }

    #[test]
    fn distinct_shards_never_collide_at_the_same_instant() {
        let mut a = IdGenerator::new(1);
        let mut b = IdGenerator::new(2);
        for _ in 0..1_000 {
            assert_ne!(a.next(), b.next());
        }
    }

    #[test]
    fn display_and_parse_round_trip() {
        let mut gen = IdGenerator::new(3);
        let id = gen.next();
        let text = id.to_string();
        let parsed: Id = text.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
