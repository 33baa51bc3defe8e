use futures_util::FutureExt;
use serde_json::json;
use socketio_client::{ManagerBuilder, ManagerEvent, Payload, Socket};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), socketio_client::Error> {
    let manager = ManagerBuilder::new("http://localhost:4200/")
        .reconnection_attempts(5)
        .build()?;
    manager.on("reconnect_attempt", |event: ManagerEvent| {
        async move { println!("{event:?}") }.boxed()
    });

    // get a socket that is connected to the admin namespace
    let socket = manager.socket("/admin")?;

    // this callback gets the payload as well as an instance of the
    // socket to communicate with the server
    socket.on("test", |payload: Payload, socket: Socket| {
        async move {
            println!("Received: {payload:?}");
            if let Err(err) = socket.emit("test", json!({"got ack": true})) {
                eprintln!("Could not answer: {err}");
            }
        }
        .boxed()
    });
    socket.on("connect_error", |err, _| {
        async move { eprintln!("Error: {err:?}") }.boxed()
    });

    // emit to the "foo" event
    socket.emit("foo", json!({"token": 123}))?;

    // emit with an ack
    match socket
        .timeout(Duration::from_secs(2))
        .emit_with_ack_async("test", json!({"myAckData": 123}))
        .await
    {
        Ok(message) => println!("Ack data: {message:?}"),
        Err(err) => eprintln!("No ack: {err}"),
    }

    socket.disconnect()?;
    Ok(())
}
