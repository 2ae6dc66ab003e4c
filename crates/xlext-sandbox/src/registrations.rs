use anyhow::{anyhow, bail, Result};
use jsonschema::validator_for;
use serde_json::Value;

const REGISTRATION_NAME_MAX_CHARS: usize = 64;

pub(crate) fn is_valid_extension_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= REGISTRATION_NAME_MAX_CHARS
        && name.chars().all(|character| {
            character.is_ascii_lowercase()
                || character.is_ascii_digit()
                || character == '-'
                || character == '_'
                || character == '.'
        })
}

/// Normalizes a command name registered by an extension. A leading `/` is
/// accepted and stripped; the stored name never carries it.
pub fn normalize_extension_command_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("extension command name must not be empty");
    }
    let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        bail!("extension command name must not be '/'");
    }
    if trimmed.chars().any(char::is_whitespace) {
        bail!(
            "extension command '{}' must not contain whitespace",
            raw.trim()
        );
    }
    if !is_valid_extension_identifier(trimmed) {
        bail!(
            "extension command '{}' must contain only lowercase alphanumeric, dash, underscore, or dot characters (max {} chars)",
            raw.trim(),
            REGISTRATION_NAME_MAX_CHARS
        );
    }
    Ok(trimmed.to_string())
}

pub fn validate_extension_tool_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if !is_valid_extension_identifier(trimmed) {
        bail!(
            "extension tool '{}' must be 1-{} lowercase alphanumeric, dash, underscore, or dot characters",
            trimmed,
            REGISTRATION_NAME_MAX_CHARS
        );
    }
    Ok(trimmed.to_string())
}

/// Checks that a tool's parameter schema is an object schema the agent loop
/// can validate arguments against.
pub fn validate_tool_parameters_schema(name: &str, schema: &Value) -> Result<()> {
    let schema_object = schema.as_object().ok_or_else(|| {
        anyhow!(
            "extension tool '{}' parameters must be a JSON object",
            name
        )
    })?;
    let schema_type = schema_object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            anyhow!(
                "extension tool '{}' parameters must include string field 'type'",
                name
            )
        })?;
    if schema_type != "object" {
        bail!(
            "extension tool '{}' parameters field 'type' must be 'object'",
            name
        );
    }
    if let Some(properties) = schema_object.get("properties") {
        if !properties.is_object() {
            bail!(
                "extension tool '{}' parameters field 'properties' must be a JSON object",
                name
            );
        }
    }
    if let Some(required) = schema_object.get("required") {
        let required = required.as_array().ok_or_else(|| {
            anyhow!(
                "extension tool '{}' parameters field 'required' must be an array",
                name
            )
        })?;
        if required.iter().any(|entry| match entry.as_str() {
            Some(value) => value.trim().is_empty(),
            None => true,
        }) {
            bail!(
                "extension tool '{}' parameters field 'required' must contain non-empty strings",
                name
            );
        }
    }
    validator_for(schema).map_err(|error| {
        anyhow!(
            "extension tool '{}' parameters schema does not compile: {}",
            name,
            error
        )
    })?;
    Ok(())
}

/// Validates tool arguments against the registered schema before they are
/// forwarded into the sandbox.
pub fn validate_tool_arguments(name: &str, schema: &Value, arguments: &Value) -> Result<()> {
    let validator = validator_for(schema).map_err(|error| {
        anyhow!(
            "extension tool '{}' parameters schema does not compile: {}",
            name,
            error
        )
    })?;
    let mut errors = validator.iter_errors(arguments);
    if let Some(first) = errors.next() {
        bail!("extension tool '{}' arguments are invalid: {}", name, first);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        normalize_extension_command_name, validate_extension_tool_name, validate_tool_arguments,
        validate_tool_parameters_schema,
    };

    #[test]
    fn unit_command_names_are_normalized_without_leading_slash() {
        assert_eq!(
            normalize_extension_command_name(" /sum-range ").expect("valid"),
            "sum-range"
        );
        assert!(normalize_extension_command_name("/").is_err());
        assert!(normalize_extension_command_name("two words").is_err());
        assert!(normalize_extension_command_name("Upper").is_err());
    }

    #[test]
    fn unit_tool_names_follow_identifier_rules() {
        assert_eq!(
            validate_extension_tool_name("lookup_rate").expect("valid"),
            "lookup_rate"
        );
        assert!(validate_extension_tool_name("").is_err());
        assert!(validate_extension_tool_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn functional_tool_schema_must_be_object_schema() {
        let schema = json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        });
        validate_tool_parameters_schema("lookup", &schema).expect("valid schema");
        validate_tool_arguments("lookup", &schema, &json!({ "query": "rates" }))
            .expect("valid args");
        let error = validate_tool_arguments("lookup", &schema, &json!({}))
            .expect_err("missing required");
        assert!(error.to_string().contains("arguments are invalid"));

        assert!(validate_tool_parameters_schema("lookup", &json!({ "type": "array" })).is_err());
        assert!(validate_tool_parameters_schema("lookup", &json!("object")).is_err());
        assert!(validate_tool_parameters_schema(
            "lookup",
            &json!({ "type": "object", "required": [""] })
        )
        .is_err());
    }
}
