use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    broadcast_messages (id) {
        id -> BigInt,
        account_id -> Text,
        device_id -> Text,
        campaign_id -> Nullable<BigInt>,
        sequence_id -> Nullable<BigInt>,
        sequence_step_id -> Nullable<BigInt>,
        recipient_address -> Text,
        recipient_name -> Text,
        message_kind -> Text,
        content -> Text,
        media_url -> Nullable<Text>,
        min_delay_seconds -> Integer,
        max_delay_seconds -> Integer,
        status -> Text,
        scheduled_at -> Nullable<Timestamptz>,
        processing_worker_id -> Nullable<Text>,
        processing_started_at -> Nullable<Timestamptz>,
        sent_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    sequences (id) {
        id -> BigInt,
        account_id -> Text,
        device_id -> Text,
        name -> Text,
        is_active -> Bool,
        min_delay_seconds -> Integer,
        max_delay_seconds -> Integer,
        created_at -> Timestamptz,
    }
}

table! {
    sequence_steps (id) {
        id -> BigInt,
        sequence_id -> BigInt,
        day_number -> Integer,
        trigger -> Text,
        next_trigger -> Nullable<Text>,
        trigger_delay_hours -> Integer,
        min_delay_seconds -> Nullable<Integer>,
        max_delay_seconds -> Nullable<Integer>,
        message_kind -> Text,
        content -> Text,
        media_url -> Nullable<Text>,
        is_entry_point -> Bool,
    }
}

table! {
    sequence_contacts (id) {
        id -> BigInt,
        sequence_id -> BigInt,
        recipient_address -> Text,
        recipient_name -> Text,
        current_step -> Integer,
        current_trigger -> Text,
        status -> Text,
        next_trigger_time -> Timestamptz,
        assigned_device_id -> Text,
        sequence_step_id -> BigInt,
        activated_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

table! {
    campaigns (id) {
        id -> BigInt,
        account_id -> Text,
        title -> Text,
        message_kind -> Text,
        content -> Text,
        media_url -> Nullable<Text>,
        niche -> Text,
        target_status -> Nullable<Text>,
        scheduled_at -> Timestamptz,
        min_delay_seconds -> Integer,
        max_delay_seconds -> Integer,
        status -> Text,
        fanned_out_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

table! {
    devices (id) {
        id -> Text,
        account_id -> Text,
        name -> Text,
        kind -> Text,
        platform -> Nullable<Text>,
        api_token -> Nullable<Text>,
    }
}

table! {
    recipients (id) {
        id -> BigInt,
        account_id -> Text,
        device_id -> Nullable<Text>,
        address -> Text,
        name -> Text,
        niche -> Text,
        status -> Text,
        entry_trigger -> Nullable<Text>,
    }
}

allow_tables_to_appear_in_same_query!(
    broadcast_messages,
    sequences,
    sequence_steps,
    sequence_contacts,
    campaigns,
    devices,
    recipients,
);
