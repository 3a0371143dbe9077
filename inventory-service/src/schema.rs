diesel::table! {
    inventory_items (product_id) {
        product_id -> Varchar,
        available_quantity -> Int4,
        reserved_quantity -> Int4,
        total_quantity -> Int4,
        version -> Int8,
        low_stock_threshold -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_reservations (id) {
        id -> Uuid,
        product_id -> Varchar,
        order_id -> Varchar,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
        released_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Varchar,
        aggregate_type -> Varchar,
        event_type -> Varchar,
        payload -> Jsonb,
        topic -> Varchar,
        status -> Varchar,
        retry_count -> Int4,
        error_message -> Nullable<Varchar>,
        created_at -> Timestamptz,
        published_at -> Nullable<Timestamptz>,
        claimed_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory_items,
    stock_reservations,
    outbox_events,
);
