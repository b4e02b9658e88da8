//! Esquema Diesel (escrito a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    workflow_executions (id) {
        id -> Uuid,
        state -> Text,
        run_id -> Nullable<Text>,
        document -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    samples (id) {
        id -> Uuid,
        puid -> Text,
        document -> Jsonb,
    }
}

diesel::table! {
    samples_workflow_executions (id) {
        id -> Uuid,
        workflow_execution_id -> Uuid,
        sample_id -> Uuid,
        position -> Int4,
        document -> Jsonb,
    }
}

diesel::table! {
    attachments (id) {
        id -> Uuid,
        attachable_type -> Text,
        attachable_id -> Uuid,
        created_at -> Timestamptz,
        document -> Jsonb,
    }
}

diesel::table! {
    activities (id) {
        id -> Uuid,
        trackable_id -> Uuid,
        activity_key -> Text,
        created_at -> Timestamptz,
        document -> Jsonb,
    }
}

diesel::table! {
    execution_state_changes (seq) {
        seq -> BigInt,
        workflow_execution_id -> Uuid,
        from_state -> Text,
        to_state -> Text,
        changed_at -> Timestamptz,
    }
}

diesel::joinable!(samples_workflow_executions -> workflow_executions (workflow_execution_id));
diesel::joinable!(execution_state_changes -> workflow_executions (workflow_execution_id));

diesel::allow_tables_to_appear_in_same_query!(
    workflow_executions,
    samples,
    samples_workflow_executions,
    attachments,
    activities,
    execution_state_changes,
);
