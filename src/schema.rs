// Trace database schema - Diesel table definitions

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

diesel::table! {
    matchers (id) {
        id -> Integer,
        class_name -> Text,
        matcher_type -> Text,
        name -> Text,
    }
}

diesel::table! {
    nodes (id) {
        id -> Integer,
        parent_id -> Nullable<Integer>,
        level -> Integer,
        success -> Bool,
        matcher_id -> Integer,
        start_index -> Integer,
        end_index -> Integer,
        nanos -> BigInt,
    }
}

diesel::joinable!(nodes -> matchers (matcher_id));
diesel::allow_tables_to_appear_in_same_query!(matchers, nodes);
