// Esquema Diesel de la tabla de checkpoints (igual en SQLite y Postgres).
diesel::table! {
    checkpoints (flow_id) {
        flow_id -> Text,
        version -> BigInt,
        status -> Text,
        shard -> Text,
        state -> Binary,
        created_at_ts -> BigInt,
        updated_at_ts -> BigInt,
    }
}
