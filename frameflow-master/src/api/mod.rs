use poem::endpoint::PrometheusExporter;
use poem::Route;
use poem_openapi::{OpenApiService, Tags};
use prometheus::Registry;

mod healthcheck;

pub use healthcheck::HealthcheckApi;

#[derive(Tags)]
enum ApiTags {
    HealthCheck,
}

pub fn make_open_api_service() -> OpenApiService<HealthcheckApi, ()> {
    OpenApiService::new(HealthcheckApi, "Frameflow Master", crate::VERSION)
}

pub fn combined_routes(prometheus_registry: Registry) -> Route {
    let api_service = make_open_api_service();
    let ui = api_service.swagger_ui();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
}
