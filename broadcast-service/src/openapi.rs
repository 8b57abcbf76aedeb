use utoipa::openapi::{InfoBuilder, OpenApi, OpenApiBuilder, Paths};

/// Minimal OpenAPI specification for the Broadcast Service.
pub fn doc() -> OpenApi {
    OpenApiBuilder::new()
        .info(
            InfoBuilder::new()
                .title("Pulse Broadcast Service API")
                .version("1.0.0")
                .description(Some(
                    "Live stream and recording lifecycle endpoints for the Pulse platform.",
                ))
                .build(),
        )
        .paths(Paths::new())
        .build()
}
