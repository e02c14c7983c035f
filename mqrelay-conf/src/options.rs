use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// MQTT listen address, overrides the config file
    #[structopt(name = "mqtt-listen-address", long)]
    pub mqtt_listen_address: Option<String>,

    /// HTTP listen address, overrides the config file
    #[structopt(name = "http-listen-address", long)]
    pub http_listen_address: Option<String>,

    /// Publisher name: noop, kafka, rabbitmq, sqs or sns
    #[structopt(name = "publisher", long)]
    pub publisher_name: Option<String>,

    /// Authenticator name: noop or plain
    #[structopt(name = "authenticator", long)]
    pub authenticator_name: Option<String>,
}
