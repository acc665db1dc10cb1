use std::sync::Arc;

use clap::{crate_description, crate_version, Parser};
use futures::StreamExt;
use kindling_operator::{
    crd::{environment::DevStagingEnvironment, runner::RunnerPool, APP_NAME, OPERATOR_NAME},
    environment::{self, ENVIRONMENT_FULL_CONTROLLER_NAME},
    runner::{self, RUNNER_FULL_CONTROLLER_NAME},
};
use stackable_operator::{
    cli::{Command, ProductOperatorRun},
    k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{Secret, Service, ServiceAccount},
        networking::v1::Ingress,
        rbac::v1::RoleBinding,
    },
    kube::{
        runtime::{reflector::ObjectRef, watcher, Controller},
        ResourceExt,
    },
    logging::controller::report_controller_reconciled,
    CustomResourceExt,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            DevStagingEnvironment::print_yaml_schema()?;
            RunnerPool::print_yaml_schema()?;
        }
        Command::Run(ProductOperatorRun {
            product_config: _,
            watch_namespace,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "KINDLING_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;

            let environment_controller = Controller::new(
                watch_namespace.get_api::<DevStagingEnvironment>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Deployment>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Service>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Secret>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Ingress>(&client),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .run(
                environment::controller::reconcile_environment,
                environment::controller::error_policy,
                Arc::new(environment::controller::Ctx {
                    client: client.clone(),
                }),
            )
            .map(|res| {
                report_controller_reconciled(&client, ENVIRONMENT_FULL_CONTROLLER_NAME, &res);
            })
            .collect::<()>();

            let runner_pool_controller = Controller::new(
                watch_namespace.get_api::<RunnerPool>(&client),
                watcher::Config::default(),
            );
            let pool_store = runner_pool_controller.store();
            let runner_pool_controller = runner_pool_controller
                .owns(
                    watch_namespace.get_api::<Deployment>(&client),
                    watcher::Config::default(),
                )
                .owns(
                    watch_namespace.get_api::<ServiceAccount>(&client),
                    watcher::Config::default(),
                )
                .owns(
                    watch_namespace.get_api::<RoleBinding>(&client),
                    watcher::Config::default(),
                )
                // a rotated token must roll the runner pods
                .watches(
                    watch_namespace.get_api::<Secret>(&client),
                    watcher::Config::default(),
                    move |secret| {
                        let secret_name = secret.name_any();
                        pool_store
                            .state()
                            .into_iter()
                            .filter(move |pool| pool.spec.token_secret_ref.name == secret_name)
                            .map(|pool| ObjectRef::from_obj(&*pool))
                    },
                )
                .shutdown_on_signal()
                .run(
                    runner::controller::reconcile_runner_pool,
                    runner::controller::error_policy,
                    Arc::new(runner::controller::Ctx {
                        client: client.clone(),
                    }),
                )
                .map(|res| {
                    report_controller_reconciled(&client, RUNNER_FULL_CONTROLLER_NAME, &res);
                })
                .collect::<()>();

            futures::join!(environment_controller, runner_pool_controller);
        }
    }

    Ok(())
}
