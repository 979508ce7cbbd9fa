use linechat_domain::Username;
use linechat_protocol::{ClientFrame, ServerFrame, decode_client, decode_server, encode_client, encode_server};
use proptest::prelude::*;

fn username_strategy() -> impl Strategy<Value = Username> {
	"[A-Za-z0-9][A-Za-z0-9._-]{0,15}".prop_map(|s| Username::new(s).expect("generated username is valid"))
}

/// Free text, deliberately including the frame and field delimiters.
fn body_strategy() -> impl Strategy<Value = String> {
	proptest::collection::vec(
		prop_oneof![
			any::<char>().prop_filter("no nul", |c| *c != '\0'),
			Just(':'),
			Just('\n'),
			Just('\r'),
			Just('\\'),
			Just('|'),
		],
		0..64,
	)
	.prop_map(|chars| chars.into_iter().collect())
}

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
	proptest::collection::vec(any::<u8>(), 0..512)
}

fn client_frame_strategy() -> impl Strategy<Value = ClientFrame> {
	prop_oneof![
		(username_strategy(), proptest::option::of(body_strategy()))
			.prop_map(|(username, password)| ClientFrame::Login { username, password }),
		body_strategy().prop_map(|body| ClientFrame::General { body }),
		(username_strategy(), body_strategy()).prop_map(|(recipient, body)| ClientFrame::Private { recipient, body }),
		(body_strategy(), payload_strategy()).prop_map(|(filename, payload)| ClientFrame::File { filename, payload }),
		(username_strategy(), body_strategy(), payload_strategy()).prop_map(|(recipient, filename, payload)| {
			ClientFrame::PrivateFile {
				recipient,
				filename,
				payload,
			}
		}),
		Just(ClientFrame::Logout),
	]
}

fn server_frame_strategy() -> impl Strategy<Value = ServerFrame> {
	prop_oneof![
		username_strategy().prop_map(|username| ServerFrame::LoginOk { username }),
		body_strategy().prop_map(|reason| ServerFrame::Error { reason }),
		(username_strategy(), body_strategy()).prop_map(|(sender, body)| ServerFrame::General { sender, body }),
		(username_strategy(), body_strategy()).prop_map(|(sender, body)| ServerFrame::Private { sender, body }),
		(username_strategy(), body_strategy()).prop_map(|(recipient, body)| ServerFrame::Sent { recipient, body }),
		(username_strategy(), body_strategy(), payload_strategy()).prop_map(|(sender, filename, payload)| {
			ServerFrame::File {
				sender,
				filename,
				payload,
			}
		}),
		(username_strategy(), body_strategy(), payload_strategy()).prop_map(|(sender, filename, payload)| {
			ServerFrame::PrivateFile {
				sender,
				filename,
				payload,
			}
		}),
		proptest::collection::vec(username_strategy(), 0..6).prop_map(|users| ServerFrame::UserList { users }),
	]
}

proptest! {
	#[test]
	fn client_frames_round_trip(frame in client_frame_strategy()) {
		let line = encode_client(&frame);
		prop_assert!(!line.contains('\n'), "encoded frame must stay on one line: {line:?}");
		let decoded = decode_client(&line).expect("round-trip decode");
		prop_assert_eq!(decoded, frame);
	}

	#[test]
	fn server_frames_round_trip(frame in server_frame_strategy()) {
		let line = encode_server(&frame);
		prop_assert!(!line.contains('\n'), "encoded frame must stay on one line: {line:?}");
		let decoded = decode_server(&line).expect("round-trip decode");
		prop_assert_eq!(decoded, frame);
	}

	#[test]
	fn decode_client_never_panics(line in ".{0,256}") {
		let _ = decode_client(&line);
	}
}
