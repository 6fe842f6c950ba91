pub mod unix_timestamp {
    use serde::{
        de::{Error as DeError, Visitor},
        Deserializer, Serializer,
    };

    use coarsetime::UnixTimeStamp;
    use std::fmt;

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = Option<UnixTimeStamp>;

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: DeError,
        {
            Ok(Some(UnixTimeStamp::from_secs(value.max(0) as _)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: DeError,
        {
            Ok(Some(UnixTimeStamp::from_secs(value)))
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: DeError,
        {
            Ok(Some(UnixTimeStamp::from_secs(value.max(0.0) as _)))
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: DeError,
        {
            Ok(None)
        }

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("Unix timestamp")
        }
    }

    pub fn serialize<S: Serializer>(
        time: &Option<UnixTimeStamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => serializer.serialize_u64(time.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<UnixTimeStamp>, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}
