//! # Wrapper module
//!
//! This module provide the language runtime wrappers injected into every
//! build context. The wrapper is the only operator-authored code in a built
//! image, it translates inbound http-carried cloudevents into the user
//! handler call and serializes the return value back as a cloudevent
//! response, mapping exceptions to a 5xx structured error.

use crate::svc::crd::Language;

// -----------------------------------------------------------------------------
// constants

/// bumping this version changes every fingerprint and forces a rebuild of
/// all cached artifacts
pub const WRAPPER_VERSION: &str = "1";

const PYTHON_WRAPPER: &str = r#"import importlib
import json
import os
import traceback
from http.server import BaseHTTPRequestHandler, HTTPServer

MODULE, _, FUNC = os.environ.get("LAMBDA_HANDLER", "main.handler").rpartition(".")
HANDLER = getattr(importlib.import_module(MODULE or "main"), FUNC or "handler")


class Handler(BaseHTTPRequestHandler):
    def do_POST(self):
        length = int(self.headers.get("content-length", 0))
        try:
            event = json.loads(self.rfile.read(length) or b"{}")
            result = HANDLER(event.get("data"), event)
            body = json.dumps({
                "specversion": "1.0",
                "type": event.get("type", "") + ".response",
                "source": os.environ.get("K_SERVICE", "lambda"),
                "id": event.get("id", ""),
                "datacontenttype": "application/json",
                "data": result,
            }).encode()
            self._reply(200, body)
        except Exception:
            body = json.dumps({
                "specversion": "1.0",
                "type": "sh.lambda.handler.error",
                "source": os.environ.get("K_SERVICE", "lambda"),
                "id": "error",
                "datacontenttype": "application/json",
                "data": {"error": traceback.format_exc()},
            }).encode()
            self._reply(500, body)

    def _reply(self, status, body):
        self.send_response(status)
        self.send_header("content-type", "application/cloudevents+json")
        self.send_header("content-length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)


if __name__ == "__main__":
    HTTPServer(("", int(os.environ.get("PORT", 8080))), Handler).serve_forever()
"#;

const NODE_WRAPPER: &str = r#"const http = require("http");
const path = require("path");

const [module_, func] = (process.env.LAMBDA_HANDLER || "index.handler").split(".");
const handler = require(path.resolve("/workspace/src", module_))[func || "handler"];

http.createServer((req, res) => {
  let chunks = [];
  req.on("data", (chunk) => chunks.push(chunk));
  req.on("end", async () => {
    const reply = (status, body) => {
      res.writeHead(status, { "content-type": "application/cloudevents+json" });
      res.end(JSON.stringify(body));
    };
    try {
      const event = JSON.parse(Buffer.concat(chunks).toString() || "{}");
      const result = await handler(event.data, event);
      reply(200, {
        specversion: "1.0",
        type: `${event.type || ""}.response`,
        source: process.env.K_SERVICE || "lambda",
        id: event.id || "",
        datacontenttype: "application/json",
        data: result,
      });
    } catch (err) {
      reply(500, {
        specversion: "1.0",
        type: "sh.lambda.handler.error",
        source: process.env.K_SERVICE || "lambda",
        id: "error",
        datacontenttype: "application/json",
        data: { error: String(err && err.stack ? err.stack : err) },
      });
    }
  });
}).listen(process.env.PORT || 8080);
"#;

const GO_WRAPPER: &str = r#"package main

import (
	"encoding/json"
	"net/http"
	"os"

	handler "lambda/src"
)

type event struct {
	SpecVersion     string          `json:"specversion"`
	Type            string          `json:"type"`
	Source          string          `json:"source"`
	ID              string          `json:"id"`
	DataContentType string          `json:"datacontenttype"`
	Data            json.RawMessage `json:"data"`
}

func main() {
	port := os.Getenv("PORT")
	if port == "" {
		port = "8080"
	}

	http.HandleFunc("/", func(w http.ResponseWriter, r *http.Request) {
		var in event
		w.Header().Set("content-type", "application/cloudevents+json")

		if err := json.NewDecoder(r.Body).Decode(&in); err != nil {
			in = event{}
		}

		result, err := handler.Handle(in.Data)
		if err != nil {
			w.WriteHeader(http.StatusInternalServerError)
			json.NewEncoder(w).Encode(event{
				SpecVersion:     "1.0",
				Type:            "sh.lambda.handler.error",
				Source:          os.Getenv("K_SERVICE"),
				ID:              "error",
				DataContentType: "application/json",
				Data:            mustMarshal(map[string]string{"error": err.Error()}),
			})
			return
		}

		json.NewEncoder(w).Encode(event{
			SpecVersion:     "1.0",
			Type:            in.Type + ".response",
			Source:          os.Getenv("K_SERVICE"),
			ID:              in.ID,
			DataContentType: "application/json",
			Data:            mustMarshal(result),
		})
	})

	http.ListenAndServe(":"+port, nil)
}

func mustMarshal(v interface{}) json.RawMessage {
	raw, err := json.Marshal(v)
	if err != nil {
		return json.RawMessage(`null`)
	}
	return raw
}
"#;

// -----------------------------------------------------------------------------
// Helper functions

/// base image the build descriptor declares for the given language
pub fn base_image(language: Language) -> &'static str {
    match language {
        Language::Python => "python:3.12-slim",
        Language::Node => "node:20-slim",
        Language::Go => "golang:1.22-alpine",
    }
}

/// package manifest path the build descriptor declares for the given language
pub fn package_manifest(language: Language) -> &'static str {
    match language {
        Language::Python => "src/requirements.txt",
        Language::Node => "src/package.json",
        Language::Go => "src/go.mod",
    }
}

/// main source file of an inline blob for the given language
pub fn main_file(language: Language) -> &'static str {
    match language {
        Language::Python => "main.py",
        Language::Node => "index.js",
        Language::Go => "main.go",
    }
}

/// wrapper source files injected under /wrapper in the build context
pub fn files(language: Language) -> Vec<(&'static str, &'static str)> {
    match language {
        Language::Python => vec![("wrapper/main.py", PYTHON_WRAPPER)],
        Language::Node => vec![("wrapper/index.js", NODE_WRAPPER)],
        Language::Go => vec![("wrapper/main.go", GO_WRAPPER)],
    }
}

/// declarative build descriptor placed at /BUILD in the context
pub fn build_descriptor(language: Language, entrypoint: &str) -> String {
    format!(
        "baseImage: {}\nentrypoint: {}\npackageManifest: {}\nwrapperVersion: \"{}\"\n",
        base_image(language),
        entrypoint,
        package_manifest(language),
        WRAPPER_VERSION,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_language_has_a_wrapper() {
        for language in [Language::Python, Language::Node, Language::Go] {
            assert!(!files(language).is_empty());
            assert!(!base_image(language).is_empty());
        }
    }

    #[test]
    fn build_descriptor_declares_the_entrypoint() {
        let descriptor = build_descriptor(Language::Python, "handler");

        assert!(descriptor.contains("entrypoint: handler"));
        assert!(descriptor.contains("baseImage: python:3.12-slim"));
        assert!(descriptor.contains("packageManifest: src/requirements.txt"));
    }
}
